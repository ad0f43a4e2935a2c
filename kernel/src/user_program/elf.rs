use nom::bytes::complete::{tag, take};
use nom::combinator::map_opt;
use nom::number::complete::{u16, u32, u8};
use nom::number::Endianness;
use nom::IResult;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfEndianness {
    Little,
    Big,
}

impl ElfEndianness {
    pub fn to_nom(self) -> Endianness {
        match self {
            ElfEndianness::Little => Endianness::Little,
            ElfEndianness::Big => Endianness::Big,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfUsage {
    Relocatable,
    Executable,
    Shared,
    Core,
}

// Common Architectures from https://wiki.osdev.org/ELF
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfArchitecture {
    Generic,
    Sparc,
    Mips,
    PowerPC,
    RiscV,
    Ia64,
    X86,
    X8664,
    Arm,
    Arm64,
    Other(u16),
}

// Strictly 32-bit ELFs.
#[derive(Copy, Clone, Debug)]
pub struct ElfHeader {
    pub endianness: ElfEndianness,
    pub header_version: u8,
    pub usage: ElfUsage,
    pub architecture: ElfArchitecture,
    pub elf_version: u32,
    pub program_entry: u32,
    pub program_headers_offset: u32,
    pub program_header_entry_size: u16,
    pub program_header_count: u16,
}

impl ElfHeader {
    pub const SIZE: usize = 52;

    pub fn parse(bytes: &[u8]) -> IResult<&[u8], ElfHeader> {
        let (bytes, _) = tag(&[0x7F, b'E', b'L', b'F'][..])(bytes)?;

        // Elf Bit Width, we don't parse 64-bits ELF binaries.
        let (bytes, _) = tag(&[1u8][..])(bytes)?;

        let (bytes, endianness) = map_opt(u8, |value| match value {
            1 => Some(ElfEndianness::Little),
            2 => Some(ElfEndianness::Big),
            _ => None,
        })(bytes)?;

        let endian = endianness.to_nom();

        let (bytes, header_version) = u8(bytes)?;

        // OS ABI and padding.
        let (bytes, _) = take(9usize)(bytes)?;

        let (bytes, usage) = map_opt(u16(endian), |value| match value {
            1 => Some(ElfUsage::Relocatable),
            2 => Some(ElfUsage::Executable),
            3 => Some(ElfUsage::Shared),
            4 => Some(ElfUsage::Core),
            _ => None,
        })(bytes)?;

        let (bytes, architecture) = u16(endian)(bytes)?;
        let architecture = match architecture {
            0x00 => ElfArchitecture::Generic,
            0x02 => ElfArchitecture::Sparc,
            0x03 => ElfArchitecture::X86,
            0x08 => ElfArchitecture::Mips,
            0x14 => ElfArchitecture::PowerPC,
            0x28 => ElfArchitecture::Arm,
            0x32 => ElfArchitecture::Ia64,
            0x3E => ElfArchitecture::X8664,
            0xB7 => ElfArchitecture::Arm64,
            0xF3 => ElfArchitecture::RiscV,
            other => ElfArchitecture::Other(other),
        };

        let (bytes, elf_version) = u32(endian)(bytes)?;
        let (bytes, program_entry) = u32(endian)(bytes)?;
        let (bytes, program_headers_offset) = u32(endian)(bytes)?;

        // Section header offset, flags and ELF header size.
        let (bytes, _) = take(10usize)(bytes)?;

        let (bytes, program_header_entry_size) = u16(endian)(bytes)?;
        let (bytes, program_header_count) = u16(endian)(bytes)?;

        // Section header entry size, count and string table index.
        let (bytes, _) = take(6usize)(bytes)?;

        Ok((
            bytes,
            ElfHeader {
                endianness,
                header_version,
                usage,
                architecture,
                elf_version,
                program_entry,
                program_headers_offset,
                program_header_entry_size,
                program_header_count,
            },
        ))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfProgramType {
    Ignore,
    Load,
    Dynamic,
    Interpret,
    Note,
    Shlib,
    ProgramHeaders,
    Stack,
    Other(u32),
}

/// A program header. Segment contents are not read here; the loader reads
/// them from the file page by page, on demand.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ElfProgramHeader {
    pub program_type: ElfProgramType,
    pub file_offset: u32,
    pub virtual_address: u32,
    pub file_size: u32,
    pub memory_size: u32,
    pub executable: bool,
    pub writable: bool,
    pub readable: bool,
    pub alignment: u32,
}

impl ElfProgramHeader {
    pub const SIZE: usize = 32;

    pub fn parse(bytes: &[u8], endian: Endianness) -> IResult<&[u8], Self> {
        let (bytes, program_type) = u32(endian)(bytes)?;
        let program_type = match program_type {
            0 => ElfProgramType::Ignore,
            1 => ElfProgramType::Load,
            2 => ElfProgramType::Dynamic,
            3 => ElfProgramType::Interpret,
            4 => ElfProgramType::Note,
            5 => ElfProgramType::Shlib,
            6 => ElfProgramType::ProgramHeaders,
            0x6474_e551 => ElfProgramType::Stack,
            other => ElfProgramType::Other(other),
        };

        let (bytes, file_offset) = u32(endian)(bytes)?;
        let (bytes, virtual_address) = u32(endian)(bytes)?;
        let (bytes, _physical_address) = u32(endian)(bytes)?;
        let (bytes, file_size) = u32(endian)(bytes)?;
        let (bytes, memory_size) = u32(endian)(bytes)?;
        let (bytes, flags) = u32(endian)(bytes)?;
        let (bytes, alignment) = u32(endian)(bytes)?;

        let executable = flags & 1 != 0;
        let writable = flags & 2 != 0;
        let readable = flags & 4 != 0;

        Ok((
            bytes,
            ElfProgramHeader {
                program_type,
                file_offset,
                virtual_address,
                file_size,
                memory_size,
                executable,
                writable,
                readable,
                alignment,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes() -> [u8; ElfHeader::SIZE] {
        let mut bytes = [0u8; ElfHeader::SIZE];
        bytes[..7].copy_from_slice(&[0x7F, b'E', b'L', b'F', 1, 1, 1]);
        bytes[16..18].copy_from_slice(&2u16.to_le_bytes());
        bytes[18..20].copy_from_slice(&3u16.to_le_bytes());
        bytes[20..24].copy_from_slice(&1u32.to_le_bytes());
        bytes[24..28].copy_from_slice(&0x0804_8080u32.to_le_bytes());
        bytes[28..32].copy_from_slice(&52u32.to_le_bytes());
        bytes[42..44].copy_from_slice(&32u16.to_le_bytes());
        bytes[44..46].copy_from_slice(&2u16.to_le_bytes());
        bytes
    }

    #[test]
    fn parse_header() {
        let bytes = header_bytes();
        let (rest, header) = ElfHeader::parse(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(header.endianness, ElfEndianness::Little);
        assert_eq!(header.usage, ElfUsage::Executable);
        assert_eq!(header.architecture, ElfArchitecture::X86);
        assert_eq!(header.program_entry, 0x0804_8080);
        assert_eq!(header.program_headers_offset, 52);
        assert_eq!(header.program_header_entry_size, 32);
        assert_eq!(header.program_header_count, 2);
    }

    #[test]
    fn reject_bad_magic_and_64_bit() {
        let mut bytes = header_bytes();
        bytes[1] = b'X';
        assert!(ElfHeader::parse(&bytes).is_err());

        let mut bytes = header_bytes();
        bytes[4] = 2;
        assert!(ElfHeader::parse(&bytes).is_err());
    }

    #[test]
    fn truncated_header() {
        let bytes = header_bytes();
        assert!(ElfHeader::parse(&bytes[..40]).is_err());
    }

    #[test]
    fn parse_program_header() {
        let fields: [u32; 8] = [1, 0x2010, 0x0804_c010, 0x0804_c010, 0x100, 0x1800, 6, 0x1000];
        let bytes: alloc::vec::Vec<u8> = fields.iter().flat_map(|f| f.to_be_bytes()).collect();
        let (rest, header) = ElfProgramHeader::parse(&bytes, Endianness::Big).unwrap();
        assert!(rest.is_empty());
        assert_eq!(
            header,
            ElfProgramHeader {
                program_type: ElfProgramType::Load,
                file_offset: 0x2010,
                virtual_address: 0x0804_c010,
                file_size: 0x100,
                memory_size: 0x1800,
                executable: false,
                writable: true,
                readable: true,
                alignment: 0x1000,
            }
        );
    }
}
