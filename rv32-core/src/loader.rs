//! Memory-image loaders: ELF32, Verilog hex (32-bit and 8-bit token width), and raw binary.
//!
//! These populate a [`PhysicalMemory`] before a [`Hart`](crate::hart::Hart) ever ticks; there is
//! no interaction with CSRs, traps, or the MMU here; images are placed by physical address.

use std::path::Path;

use goblin::elf::header::{EM_RISCV, ET_EXEC};
use goblin::elf::section_header::{SHT_INIT_ARRAY, SHT_PROGBITS};
use thiserror::Error;

use crate::memory::PhysicalMemory;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to read image {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse ELF image {path}: {source}")]
    ElfParse {
        path: String,
        #[source]
        source: goblin::error::Error,
    },
    #[error("{path} is not a little-endian RV32 executable ELF")]
    UnsupportedElf { path: String },
    #[error("malformed token {token:?} in Verilog hex image {path}")]
    BadToken { path: String, token: String },
}

/// Which loader a path selects, per the extension heuristic: `.elf` is ELF32, `.vhex8` is the
/// byte-token Verilog hex variant, anything else is the word-token Verilog hex variant.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ImageFormat {
    Elf32,
    VerilogHex32,
    VerilogHex8,
}

impl ImageFormat {
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("elf") => Self::Elf32,
            Some("vhex8") => Self::VerilogHex8,
            _ => Self::VerilogHex32,
        }
    }
}

/// Loads `path` into `memory`, resolving relative paths with no directory component under `root`,
/// and dispatching to the right format by extension.
pub fn load_image(memory: &mut PhysicalMemory, root: &Path, path: &str) -> Result<(), LoadError> {
    let path = Path::new(path);
    let resolved = if path.is_relative() && path.components().count() == 1 {
        root.join(path)
    } else {
        path.to_path_buf()
    };
    let display_path = resolved.display().to_string();
    let data = std::fs::read(&resolved).map_err(|source| LoadError::Io {
        path: display_path.clone(),
        source,
    })?;

    match ImageFormat::for_path(path) {
        ImageFormat::Elf32 => load_elf32(memory, &display_path, &data),
        ImageFormat::VerilogHex32 => load_verilog_hex(memory, &display_path, &data, 4),
        ImageFormat::VerilogHex8 => load_verilog_hex(memory, &display_path, &data, 1),
    }
}

/// Raw binary: loaded byte-by-byte at `base_address`, with no parsing at all.
pub fn load_raw_binary(memory: &mut PhysicalMemory, base_address: u64, data: &[u8]) {
    memory.load_image(base_address, data);
}

/// Copies every `PT_LOAD` segment's `PROGBITS`/`INIT_ARRAY` sections to their declared virtual
/// addresses. Only little-endian, 32-bit, `ET_EXEC`, `EM_RISCV` images are accepted.
fn load_elf32(memory: &mut PhysicalMemory, display_path: &str, data: &[u8]) -> Result<(), LoadError> {
    let elf = goblin::elf::Elf::parse(data).map_err(|source| LoadError::ElfParse {
        path: display_path.to_string(),
        source,
    })?;

    if elf.is_64
        || elf.header.e_machine != EM_RISCV
        || elf.header.e_type != ET_EXEC
        || !elf.little_endian
    {
        return Err(LoadError::UnsupportedElf {
            path: display_path.to_string(),
        });
    }

    for segment in elf.program_headers.iter().filter(|h| h.is_write() || h.is_read() || h.is_executable()) {
        if segment.p_type != goblin::elf::program_header::PT_LOAD {
            continue;
        }
        for section in elf.section_headers.iter() {
            if section.sh_type != SHT_PROGBITS && section.sh_type != SHT_INIT_ARRAY {
                continue;
            }
            let sec_start = section.sh_addr;
            let sec_end = sec_start + section.sh_size;
            let seg_start = segment.p_vaddr;
            let seg_end = seg_start + segment.p_memsz;
            if sec_start < seg_start || sec_end > seg_end || section.sh_size == 0 {
                continue;
            }
            let file_range = section.file_range();
            if let Some(range) = file_range {
                if let Some(bytes) = data.get(range) {
                    memory.load_image(sec_start, bytes);
                }
            }
        }
    }

    Ok(())
}

/// Parses a Verilog hex stream: whitespace-separated tokens, `@<hex>` sets the current address
/// (in units of `token_width` bytes), any other token is a hex number written at the current
/// address before it advances by `token_width`. Leading zeroes may be omitted on any token.
fn load_verilog_hex(
    memory: &mut PhysicalMemory,
    display_path: &str,
    data: &[u8],
    token_width: u32,
) -> Result<(), LoadError> {
    let text = String::from_utf8_lossy(data);
    let mut address: u64 = 0;

    for token in text.split_whitespace() {
        if let Some(hex) = token.strip_prefix('@') {
            address = u64::from_str_radix(hex, 16).map_err(|_| LoadError::BadToken {
                path: display_path.to_string(),
                token: token.to_string(),
            })? * token_width as u64;
            continue;
        }

        let value = u32::from_str_radix(token, 16).map_err(|_| LoadError::BadToken {
            path: display_path.to_string(),
            token: token.to_string(),
        })?;

        let bytes = value.to_le_bytes();
        let bytes = &bytes[..token_width as usize];
        memory.load_image(address, bytes);
        address += token_width as u64;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::CsrFile;

    #[test]
    fn verilog_hex_32_places_words_at_incrementing_addresses() {
        let mut memory = PhysicalMemory::new();
        load_verilog_hex(&mut memory, "test", b"@00000000 89ABCDEF 00112233", 4).unwrap();
        let csr = CsrFile::new();
        let mut buf = [0u8; 4];
        memory.read(0, &mut buf, &csr).unwrap();
        assert_eq!(buf, [0xEF, 0xCD, 0xAB, 0x89]);
        memory.read(4, &mut buf, &csr).unwrap();
        assert_eq!(buf, [0x33, 0x22, 0x11, 0x00]);
    }

    #[test]
    fn verilog_hex_8_places_bytes_at_incrementing_addresses() {
        let mut memory = PhysicalMemory::new();
        load_verilog_hex(&mut memory, "test", b"@10 AB CD EF", 1).unwrap();
        let csr = CsrFile::new();
        let mut buf = [0u8; 1];
        memory.read(0x10, &mut buf, &csr).unwrap();
        assert_eq!(buf, [0xAB]);
        memory.read(0x12, &mut buf, &csr).unwrap();
        assert_eq!(buf, [0xEF]);
    }

    #[test]
    fn missing_leading_zeroes_are_tolerated_in_address() {
        let mut memory = PhysicalMemory::new();
        load_verilog_hex(&mut memory, "test", b"@4000 1", 4).unwrap();
        let csr = CsrFile::new();
        let mut buf = [0u8; 4];
        memory.read(0x10000, &mut buf, &csr).unwrap();
        assert_eq!(buf, [1, 0, 0, 0]);
    }

    #[test]
    fn image_format_for_path_follows_extension_heuristic() {
        assert_eq!(ImageFormat::for_path(Path::new("fw.elf")), ImageFormat::Elf32);
        assert_eq!(ImageFormat::for_path(Path::new("fw.vhex8")), ImageFormat::VerilogHex8);
        assert_eq!(ImageFormat::for_path(Path::new("fw.hex")), ImageFormat::VerilogHex32);
        assert_eq!(ImageFormat::for_path(Path::new("fw")), ImageFormat::VerilogHex32);
    }
}
