//! Binary C3D container parsing
//!
//! C3D files are organized in 512-byte blocks: a header block, a parameter
//! section (groups INFO, SUBJECTS, ANALOG, POINT with typed parameters) and
//! a data section of interleaved 3D point and analog frames. Only the
//! little-endian (Intel, processor type 84) layout produced by the game is
//! supported. All reads are bounds-checked; a truncated file surfaces as an
//! error, never a panic.

use std::collections::HashMap;

pub const BLOCK_SIZE: usize = 512;
pub const HEADER_MAGIC: u8 = 0x50;
pub const PROCESSOR_INTEL: u8 = 84;

// ============================================================================
// Bounds-checked little-endian reader
// ============================================================================

pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn seek(&mut self, pos: usize) -> Result<(), String> {
        if pos > self.data.len() {
            return Err(format!("seek to {pos} beyond file length {}", self.data.len()));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8, String> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| format!("unexpected end of file at offset {}", self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_i8(&mut self) -> Result<i8, String> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16, String> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_i16(&mut self) -> Result<i16, String> {
        let bytes = self.read_bytes(2)?;
        Ok(i16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_f32(&mut self) -> Result<f32, String> {
        let bytes = self.read_bytes(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], String> {
        let end = self.pos.checked_add(len).ok_or("length overflow")?;
        if end > self.data.len() {
            return Err(format!(
                "unexpected end of file: need {len} bytes at offset {}",
                self.pos
            ));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

// ============================================================================
// Header
// ============================================================================

/// Fixed-layout header block fields.
#[derive(Debug, Clone)]
pub struct Header {
    pub parameter_block: u8,
    pub points_per_frame: u16,
    /// Total analog samples per 3D frame (channels x subframes).
    pub analog_per_frame: u16,
    pub first_frame: u16,
    pub last_frame: u16,
    pub point_scale: f32,
    pub data_start_block: u16,
    /// Analog samples per channel per 3D frame.
    pub analog_subframes: u16,
    pub point_rate: f32,
}

impl Header {
    pub fn frame_count(&self) -> u32 {
        (self.last_frame as u32).saturating_sub(self.first_frame as u32) + 1
    }

    /// Negative POINT:SCALE marks floating-point sample data.
    pub fn is_float_data(&self) -> bool {
        self.point_scale < 0.0
    }
}

pub fn parse_header(data: &[u8]) -> Result<Header, String> {
    if data.len() < BLOCK_SIZE {
        return Err(format!("file too small for header: {} bytes", data.len()));
    }
    let mut r = ByteReader::new(data);
    let parameter_block = r.read_u8()?;
    let magic = r.read_u8()?;
    if magic != HEADER_MAGIC {
        return Err(format!("bad header magic 0x{magic:02x}, expected 0x50"));
    }
    if parameter_block == 0 {
        return Err("parameter block pointer is zero".into());
    }
    let points_per_frame = r.read_u16()?;
    let analog_per_frame = r.read_u16()?;
    let first_frame = r.read_u16()?;
    let last_frame = r.read_u16()?;
    let _max_gap = r.read_u16()?;
    let point_scale = r.read_f32()?;
    let data_start_block = r.read_u16()?;
    let analog_subframes = r.read_u16()?;
    let point_rate = r.read_f32()?;

    Ok(Header {
        parameter_block,
        points_per_frame,
        analog_per_frame,
        first_frame,
        last_frame,
        point_scale,
        data_start_block,
        analog_subframes,
        point_rate,
    })
}

// ============================================================================
// Parameter section
// ============================================================================

/// Typed payload of a single parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamData {
    /// Character data: one string per trailing-dimension entry.
    Char(Vec<String>),
    Byte(Vec<i8>),
    Integer(Vec<i16>),
    Float(Vec<f32>),
}

impl ParamData {
    pub fn first_f64(&self) -> Option<f64> {
        match self {
            ParamData::Float(v) => v.first().map(|&x| x as f64),
            ParamData::Integer(v) => v.first().map(|&x| x as f64),
            ParamData::Byte(v) => v.first().map(|&x| x as f64),
            ParamData::Char(v) => v.first().and_then(|s| s.trim().parse().ok()),
        }
    }

    pub fn first_string(&self) -> Option<String> {
        match self {
            ParamData::Char(v) => v.first().map(|s| s.trim().to_string()),
            ParamData::Float(v) => v.first().map(|x| x.to_string()),
            ParamData::Integer(v) => v.first().map(|x| x.to_string()),
            ParamData::Byte(v) => v.first().map(|x| x.to_string()),
        }
    }

    pub fn strings(&self) -> Vec<String> {
        match self {
            ParamData::Char(v) => v.iter().map(|s| s.trim().to_string()).collect(),
            _ => Vec::new(),
        }
    }

    pub fn floats(&self) -> Vec<f64> {
        match self {
            ParamData::Float(v) => v.iter().map(|&x| x as f64).collect(),
            ParamData::Integer(v) => v.iter().map(|&x| x as f64).collect(),
            ParamData::Byte(v) => v.iter().map(|&x| x as f64).collect(),
            ParamData::Char(_) => Vec::new(),
        }
    }
}

/// Parameter groups keyed by upper-cased group name, parameters by name.
#[derive(Debug, Default, Clone)]
pub struct ParameterSection {
    pub groups: HashMap<String, HashMap<String, ParamData>>,
}

impl ParameterSection {
    pub fn get(&self, group: &str, param: &str) -> Option<&ParamData> {
        self.groups.get(group)?.get(param)
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }
}

pub fn parse_parameters(data: &[u8], header: &Header) -> Result<ParameterSection, String> {
    let start = (header.parameter_block as usize - 1) * BLOCK_SIZE;
    let mut r = ByteReader::new(data);
    r.seek(start)?;

    let _reserved1 = r.read_u8()?;
    let _reserved2 = r.read_u8()?;
    let _block_count = r.read_u8()?;
    let processor = r.read_u8()?;
    if processor != PROCESSOR_INTEL {
        return Err(format!(
            "unsupported processor type {processor}, only Intel ({PROCESSOR_INTEL}) is handled"
        ));
    }

    let mut section = ParameterSection::default();
    // Group ids are announced by definitions but parameters may precede
    // their group record, so names are resolved in a second pass.
    let mut group_names: HashMap<u8, String> = HashMap::new();
    let mut pending: Vec<(u8, String, ParamData)> = Vec::new();

    loop {
        let name_len = r.read_i8()?;
        if name_len == 0 {
            break;
        }
        let group_id = r.read_i8()?;
        let name_bytes = r.read_bytes(name_len.unsigned_abs() as usize)?;
        let name = String::from_utf8_lossy(name_bytes).to_uppercase();

        let offset_pos = r.position();
        let offset = r.read_i16()?;

        if group_id < 0 {
            // Group definition record.
            let desc_len = r.read_u8()? as usize;
            let _desc = r.read_bytes(desc_len)?;
            group_names.insert(group_id.unsigned_abs(), name);
        } else {
            let data_value = parse_parameter_data(&mut r)?;
            pending.push((group_id as u8, name, data_value));
        }

        if offset == 0 {
            break;
        }
        r.seek(offset_pos + offset as usize)?;
    }

    for (gid, name, value) in pending {
        let group = group_names
            .get(&gid)
            .cloned()
            .unwrap_or_else(|| format!("GROUP{gid}"));
        section.groups.entry(group).or_default().insert(name, value);
    }
    // Groups without parameters still count as present sections.
    for name in group_names.values() {
        section.groups.entry(name.clone()).or_default();
    }

    Ok(section)
}

fn parse_parameter_data(r: &mut ByteReader<'_>) -> Result<ParamData, String> {
    let data_type = r.read_i8()?;
    let n_dims = r.read_u8()? as usize;
    if n_dims > 7 {
        return Err(format!("parameter has {n_dims} dimensions, max is 7"));
    }
    let mut dims = Vec::with_capacity(n_dims);
    for _ in 0..n_dims {
        dims.push(r.read_u8()? as usize);
    }
    let count: usize = dims.iter().product::<usize>().max(1);

    match data_type {
        -1 => {
            // Char data: first dimension is string length, the rest index
            // multiple strings.
            let str_len = dims.first().copied().unwrap_or(count);
            let n_strings = if dims.len() > 1 {
                dims[1..].iter().product::<usize>().max(1)
            } else {
                1
            };
            let mut strings = Vec::with_capacity(n_strings);
            for _ in 0..n_strings {
                let bytes = r.read_bytes(str_len)?;
                strings.push(String::from_utf8_lossy(bytes).trim_end().to_string());
            }
            Ok(ParamData::Char(strings))
        }
        1 => {
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(r.read_i8()?);
            }
            Ok(ParamData::Byte(values))
        }
        2 => {
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(r.read_i16()?);
            }
            Ok(ParamData::Integer(values))
        }
        4 => {
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(r.read_f32()?);
            }
            Ok(ParamData::Float(values))
        }
        other => Err(format!("unknown parameter data type {other}")),
    }
}

// ============================================================================
// Analog data section
// ============================================================================

/// De-interleaved analog channels, ordered as in ANALOG:LABELS.
pub fn parse_analog_data(
    data: &[u8],
    header: &Header,
    params: &ParameterSection,
) -> Result<Vec<Vec<f64>>, String> {
    let channel_count = analog_channel_count(header, params);
    if channel_count == 0 {
        return Ok(Vec::new());
    }
    let subframes = header.analog_subframes.max(1) as usize;
    let frames = header.frame_count() as usize;
    let points = header.points_per_frame as usize;
    let float_data = header.is_float_data();
    let sample_size = if float_data { 4 } else { 2 };

    // Integer samples are scaled to physical units; float samples are
    // already physical.
    let gen_scale = params
        .get("ANALOG", "GEN_SCALE")
        .and_then(|p| p.first_f64())
        .unwrap_or(1.0);
    let scales = params
        .get("ANALOG", "SCALE")
        .map(|p| p.floats())
        .unwrap_or_default();
    let offsets = params
        .get("ANALOG", "OFFSET")
        .map(|p| p.floats())
        .unwrap_or_default();

    let start = (header.data_start_block as usize)
        .checked_sub(1)
        .ok_or("data start block is zero")?
        * BLOCK_SIZE;
    let mut r = ByteReader::new(data);
    r.seek(start)?;

    let point_values = points * 4;
    let mut channels = vec![Vec::with_capacity(frames * subframes); channel_count];

    for _frame in 0..frames {
        // Skip the 3D point samples; only analog channels are extracted.
        r.read_bytes(point_values * sample_size)?;
        for _sub in 0..subframes {
            for channel in channels.iter_mut().take(channel_count) {
                let raw = if float_data {
                    r.read_f32()? as f64
                } else {
                    r.read_i16()? as f64
                };
                channel.push(raw);
            }
        }
    }

    if !float_data {
        for (idx, channel) in channels.iter_mut().enumerate() {
            let scale = scales.get(idx).copied().unwrap_or(1.0);
            let offset = offsets.get(idx).copied().unwrap_or(0.0);
            for v in channel.iter_mut() {
                *v = (*v - offset) * scale * gen_scale;
            }
        }
    }

    Ok(channels)
}

/// Channel count from ANALOG:USED, falling back to the header layout.
pub fn analog_channel_count(header: &Header, params: &ParameterSection) -> usize {
    if let Some(used) = params.get("ANALOG", "USED").and_then(|p| p.first_f64()) {
        return used as usize;
    }
    let subframes = header.analog_subframes.max(1) as usize;
    header.analog_per_frame as usize / subframes
}
