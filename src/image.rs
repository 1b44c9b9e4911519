//! Structural view of a compiled binary image.
//!
//! [`ImageInfo`] owns the raw bytes and pre-parses the pieces the
//! interpreter needs on its hot path: function descriptors, float
//! literals, role classes and string literals. Only shape errors are
//! caught here; dataflow checks live in the verifier.

use crate::{
    error::{VerifyError, VerifyResult},
    format::{
        FIX_HEADER_SIZE, FUNCTION_HEADER_SIZE, MAGIC0, MAGIC1, NUM_SECTIONS, ROLE_HEADER_SIZE,
        SECTION_HEADER_SIZE, STRING_HEADER_SIZE,
    },
};

pub const SECT_FUNCTIONS: usize = 0;
pub const SECT_CODE: usize = 1;
pub const SECT_FLOATS: usize = 2;
pub const SECT_ROLES: usize = 3;
pub const SECT_STRING_HEADERS: usize = 4;
pub const SECT_STRING_DATA: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinSection {
    /// Byte offset from the start of the image
    pub start: usize,
    pub length: usize,
}

impl BinSection {
    pub fn end(&self) -> usize {
        self.start + self.length
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionInfo {
    /// Absolute halfword index of the first instruction
    pub start_pc: u32,
    pub num_words: u32,
    pub num_locals: u16,
    pub num_regs: u8,
    pub num_args: u8,
}

impl FunctionInfo {
    pub fn end_pc(&self) -> u32 {
        self.start_pc + self.num_words
    }

    /// Activation slot count: declared locals plus register save area.
    pub fn num_slots(&self) -> usize {
        self.num_locals as usize + self.num_regs as usize
    }
}

#[derive(Debug, Clone)]
pub struct ImageInfo {
    data: Vec<u8>,
    pub num_globals: u16,
    pub sections: [BinSection; NUM_SECTIONS],
    pub functions: Vec<FunctionInfo>,
    pub floats: Vec<f64>,
    pub role_classes: Vec<u32>,
    pub strings: Vec<String>,
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

impl ImageInfo {
    pub fn parse(image: &[u8]) -> VerifyResult<Self> {
        let min = FIX_HEADER_SIZE + NUM_SECTIONS * SECTION_HEADER_SIZE;
        if image.len() < min {
            return Err(VerifyError::new(0, "image too short"));
        }
        if read_u32(image, 0) != MAGIC0 {
            return Err(VerifyError::new(0, "bad magic"));
        }
        if read_u32(image, 4) != MAGIC1 {
            return Err(VerifyError::new(4, "bad magic"));
        }
        let num_globals = read_u16(image, 8);

        let mut sections = [BinSection {
            start: 0,
            length: 0,
        }; NUM_SECTIONS];
        for (i, section) in sections.iter_mut().enumerate() {
            let hd = FIX_HEADER_SIZE + i * SECTION_HEADER_SIZE;
            let start = read_u32(image, hd) as usize;
            let length = read_u32(image, hd + 4) as usize;
            if start > image.len() || image.len() - start < length {
                return Err(VerifyError::new(hd, "section out of bounds"));
            }
            *section = BinSection { start, length };
        }

        let functions = Self::parse_functions(image, &sections)?;
        let floats = Self::parse_floats(image, &sections)?;
        let role_classes = Self::parse_roles(image, &sections)?;
        let strings = Self::parse_strings(image, &sections)?;

        Ok(Self {
            data: image.to_vec(),
            num_globals,
            sections,
            functions,
            floats,
            role_classes,
            strings,
        })
    }

    fn parse_functions(
        image: &[u8],
        sections: &[BinSection; NUM_SECTIONS],
    ) -> VerifyResult<Vec<FunctionInfo>> {
        let sect = &sections[SECT_FUNCTIONS];
        if sect.length % FUNCTION_HEADER_SIZE != 0 {
            return Err(VerifyError::new(sect.start, "ragged function table"));
        }

        let mut functions = Vec::with_capacity(sect.length / FUNCTION_HEADER_SIZE);
        for hd in (sect.start..sect.end()).step_by(FUNCTION_HEADER_SIZE) {
            let offset = read_u32(image, hd) as usize;
            let length = read_u32(image, hd + 4) as usize;
            if offset % 2 != 0 || length % 2 != 0 {
                return Err(VerifyError::new(hd, "misaligned function body"));
            }
            if offset > image.len() || image.len() - offset < length {
                return Err(VerifyError::new(hd, "function body out of bounds"));
            }
            let packed = image[hd + 10];
            functions.push(FunctionInfo {
                start_pc: (offset / 2) as u32,
                num_words: (length / 2) as u32,
                num_locals: read_u16(image, hd + 8),
                num_regs: packed & 0xf,
                num_args: packed >> 4,
            });
        }
        Ok(functions)
    }

    fn parse_floats(
        image: &[u8],
        sections: &[BinSection; NUM_SECTIONS],
    ) -> VerifyResult<Vec<f64>> {
        let sect = &sections[SECT_FLOATS];
        if sect.length % 8 != 0 {
            return Err(VerifyError::new(sect.start, "ragged float table"));
        }
        Ok((sect.start..sect.end())
            .step_by(8)
            .map(|offset| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&image[offset..offset + 8]);
                f64::from_le_bytes(bytes)
            })
            .collect())
    }

    fn parse_roles(
        image: &[u8],
        sections: &[BinSection; NUM_SECTIONS],
    ) -> VerifyResult<Vec<u32>> {
        let sect = &sections[SECT_ROLES];
        if sect.length % ROLE_HEADER_SIZE != 0 {
            return Err(VerifyError::new(sect.start, "ragged role table"));
        }
        Ok((sect.start..sect.end())
            .step_by(ROLE_HEADER_SIZE)
            .map(|offset| read_u32(image, offset))
            .collect())
    }

    fn parse_strings(
        image: &[u8],
        sections: &[BinSection; NUM_SECTIONS],
    ) -> VerifyResult<Vec<String>> {
        let headers = &sections[SECT_STRING_HEADERS];
        let data = &sections[SECT_STRING_DATA];
        if headers.length % STRING_HEADER_SIZE != 0 {
            return Err(VerifyError::new(headers.start, "ragged string table"));
        }

        let mut strings = Vec::with_capacity(headers.length / STRING_HEADER_SIZE);
        for hd in (headers.start..headers.end()).step_by(STRING_HEADER_SIZE) {
            let offset = read_u32(image, hd) as usize;
            let length = read_u32(image, hd + 4) as usize;
            // the terminating NUL must also fit inside the data section
            if offset > data.length || data.length - offset <= length {
                return Err(VerifyError::new(hd, "string out of bounds"));
            }
            let start = data.start + offset;
            let bytes = &image[start..start + length];
            if image[start + length] != 0 {
                return Err(VerifyError::new(hd, "string not NUL terminated"));
            }
            match core::str::from_utf8(bytes) {
                Ok(s) => strings.push(s.to_string()),
                Err(_) => return Err(VerifyError::new(hd, "string is not valid UTF-8")),
            }
        }
        Ok(strings)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Instruction word at an absolute halfword index.
    pub fn word(&self, pc: u32) -> u16 {
        let offset = pc as usize * 2;
        read_u16(&self.data, offset)
    }

    /// The function whose body covers `pc`, if any.
    pub fn function_at(&self, pc: u32) -> Option<(usize, &FunctionInfo)> {
        self.functions
            .iter()
            .enumerate()
            .find(|(_, f)| f.start_pc <= pc && pc < f.end_pc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, MemoryHost};

    fn image_of(src: &str) -> ImageInfo {
        let mut host = MemoryHost::default();
        let out = compile(&mut host, src);
        assert!(out.success, "{:?}", out.errors);
        ImageInfo::parse(&out.binary).unwrap()
    }

    #[test]
    fn rejects_garbage() {
        assert!(ImageInfo::parse(&[]).is_err());
        assert!(ImageInfo::parse(&[0u8; 200]).is_err());
    }

    #[test]
    fn rejects_flipped_magic() {
        let mut host = MemoryHost::default();
        let out = compile(&mut host, "var a = 1;");
        let mut bytes = out.binary.clone();
        bytes[0] ^= 1;
        assert!(ImageInfo::parse(&bytes).is_err());
    }

    #[test]
    fn sections_are_contiguous() {
        let img = image_of("var a = 1; var s = roles.button();");
        for pair in img.sections.windows(2) {
            assert_eq!(pair[0].end(), pair[1].start);
        }
    }

    #[test]
    fn parses_pools() {
        let img = image_of(
            "var t = roles.temperature(); var x = 0.5; print(\"x={0}\", x);",
        );
        assert!(img.floats.contains(&0.5));
        assert_eq!(img.role_classes, vec![0x1421_bac7]);
        assert_eq!(img.strings, vec!["x={0}".to_string()]);
        assert_eq!(img.num_globals, 1);
    }

    #[test]
    fn function_lookup_by_pc() {
        let img = image_of("function f() { return 1; } var a = f();");
        let main = img.functions[0];
        assert_eq!(img.function_at(main.start_pc).unwrap().0, 0);
        assert_eq!(img.function_at(main.end_pc() - 1).unwrap().0, 0);
    }
}
