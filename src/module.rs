//! The `.lvme` module container.
//!
//! An immutable executable image: text, rodata, data, a bss length and the
//! entry point. The on-disk layout is little-endian throughout:
//!
//! ```text
//! offset  size  field
//! 0       4     magic = 'l','v','m','e'
//! 4       8     version (u64)
//! 12      8     text_length
//! 20      Tlen  text
//! ...     8     rodata_length, then rodata
//! ...     8     data_length, then data
//! ...     8     bss_length
//! ...     8     entry_point
//! ```

use crate::errors::VmError;

/// Magic bytes identifying a serialized module.
const MAGIC: &[u8; 4] = b"lvme";

/// Current container format version.
const CURRENT_VERSION: u64 = 0;

/// A loaded executable module.
///
/// Loaded exactly once into linear memory at VM init and never freed until
/// teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    /// Executable instruction bytes, mapped RX at address 0.
    pub text: Vec<u8>,
    /// Read-only constants, mapped R after text.
    pub rodata: Vec<u8>,
    /// Initialized globals, mapped RW after rodata.
    pub data: Vec<u8>,
    /// Length of the zero-initialized region mapped RW after data.
    pub bss_length: u64,
    /// Address of the first instruction the root thread executes.
    pub entry_point: u64,
}

/// Sequential little-endian reader over a byte slice.
struct Reader<'a> {
    input: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, offset: 0 }
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8], VmError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.input.len())
            .ok_or_else(|| VmError::InvalidModule {
                reason: format!("truncated reading {what}"),
            })?;
        let slice = &self.input[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u64(&mut self, what: &str) -> Result<u64, VmError> {
        let bytes = self.take(8, what)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }
}

impl Module {
    /// Parses a module from its container bytes.
    pub fn from_bytes(input: &[u8]) -> Result<Self, VmError> {
        let mut reader = Reader::new(input);

        if reader.take(MAGIC.len(), "magic")? != MAGIC {
            return Err(VmError::InvalidModule {
                reason: "bad magic".to_string(),
            });
        }
        let version = reader.u64("version")?;
        if version != CURRENT_VERSION {
            return Err(VmError::InvalidModule {
                reason: format!("unsupported version {version}"),
            });
        }

        let text_length = reader.u64("text length")? as usize;
        let text = reader.take(text_length, "text")?.to_vec();
        let rodata_length = reader.u64("rodata length")? as usize;
        let rodata = reader.take(rodata_length, "rodata")?.to_vec();
        let data_length = reader.u64("data length")? as usize;
        let data = reader.take(data_length, "data")?.to_vec();
        let bss_length = reader.u64("bss length")?;
        let entry_point = reader.u64("entry point")?;

        if reader.offset != input.len() {
            return Err(VmError::InvalidModule {
                reason: "trailing bytes".to_string(),
            });
        }

        Ok(Self {
            text,
            rodata,
            data,
            bss_length,
            entry_point,
        })
    }

    /// Serializes the module to its container layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(44 + self.text.len() + self.rodata.len() + self.data.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&CURRENT_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.text.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.text);
        out.extend_from_slice(&(self.rodata.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.rodata);
        out.extend_from_slice(&(self.data.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.bss_length.to_le_bytes());
        out.extend_from_slice(&self.entry_point.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Module {
        Module {
            text: vec![1, 2, 3],
            rodata: vec![4, 5],
            data: vec![6],
            bss_length: 128,
            entry_point: 1,
        }
    }

    #[test]
    fn round_trip() {
        let module = sample();
        let parsed = Module::from_bytes(&module.to_bytes()).unwrap();
        assert_eq!(parsed, module);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample().to_bytes();
        bytes[0] = b'x';
        assert!(matches!(
            Module::from_bytes(&bytes),
            Err(VmError::InvalidModule { reason }) if reason == "bad magic"
        ));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut bytes = sample().to_bytes();
        bytes[4] = 9;
        assert!(matches!(
            Module::from_bytes(&bytes),
            Err(VmError::InvalidModule { reason }) if reason.starts_with("unsupported version")
        ));
    }

    #[test]
    fn rejects_truncation_everywhere() {
        let bytes = sample().to_bytes();
        for len in 0..bytes.len() {
            assert!(
                Module::from_bytes(&bytes[..len]).is_err(),
                "prefix of {len} bytes must not parse"
            );
        }
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = sample().to_bytes();
        bytes.push(0);
        assert!(matches!(
            Module::from_bytes(&bytes),
            Err(VmError::InvalidModule { reason }) if reason == "trailing bytes"
        ));
    }

    #[test]
    fn empty_module_is_valid() {
        let module = Module {
            text: Vec::new(),
            rodata: Vec::new(),
            data: Vec::new(),
            bss_length: 0,
            entry_point: 0,
        };
        let parsed = Module::from_bytes(&module.to_bytes()).unwrap();
        assert_eq!(parsed, module);
    }
}
