//! Synthetic C3D fixture builder
//!
//! Emits minimal but structurally complete little-endian C3D files: header
//! block, parameter section (ANALOG / POINT / INFO / SUBJECTS groups) and a
//! float analog data section with one subframe per 3D frame. Used by the
//! parser tests and the end-to-end pipeline tests; not part of the service
//! API.

use super::parser::{BLOCK_SIZE, HEADER_MAGIC, PROCESSOR_INTEL};

/// Builder for synthetic recordings.
pub struct C3dFixture {
    sampling_rate: f64,
    channel_count: usize,
    samples: Vec<Vec<f64>>,
    game_name: Option<String>,
    level: Option<String>,
    therapist_id: Option<String>,
    time: Option<String>,
    player_name: Option<String>,
    game_score: Option<f32>,
    include_info: bool,
}

impl C3dFixture {
    pub fn new(sampling_rate: f64, channel_count: usize) -> Self {
        Self {
            sampling_rate,
            channel_count,
            samples: Vec::new(),
            game_name: None,
            level: None,
            therapist_id: None,
            time: None,
            player_name: None,
            game_score: None,
            include_info: true,
        }
    }

    pub fn with_samples(mut self, samples: Vec<Vec<f64>>) -> Self {
        assert!(!samples.is_empty(), "fixture needs at least one channel");
        let len = samples[0].len();
        assert!(
            samples.iter().all(|c| c.len() == len),
            "all channels must share a length"
        );
        assert!(len <= u16::MAX as usize, "fixture limited to 65535 frames");
        self.channel_count = samples.len();
        self.samples = samples;
        self
    }

    pub fn with_game_name(mut self, name: &str) -> Self {
        self.game_name = Some(name.to_string());
        self
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = Some(level.to_string());
        self
    }

    pub fn with_therapist_id(mut self, id: &str) -> Self {
        self.therapist_id = Some(id.to_string());
        self
    }

    pub fn with_time(mut self, time: &str) -> Self {
        self.time = Some(time.to_string());
        self
    }

    pub fn with_player_name(mut self, name: &str) -> Self {
        self.player_name = Some(name.to_string());
        self
    }

    pub fn with_game_score(mut self, score: f32) -> Self {
        self.game_score = Some(score);
        self
    }

    pub fn without_info_group(mut self) -> Self {
        self.include_info = false;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let n_frames = self.samples.first().map(|c| c.len()).unwrap_or(0);

        let params = self.build_parameter_section();
        let param_blocks = params.len().div_ceil(BLOCK_SIZE).max(1);
        let data_start_block = 2 + param_blocks;

        let mut out = Vec::new();
        out.extend_from_slice(&self.build_header(n_frames, data_start_block as u16));
        out.extend_from_slice(&params);
        out.resize((1 + param_blocks) * BLOCK_SIZE, 0);

        // Float analog data, one subframe per frame, no 3D points.
        for frame in 0..n_frames {
            for channel in &self.samples {
                out.extend_from_slice(&(channel[frame] as f32).to_le_bytes());
            }
        }
        out
    }

    fn build_header(&self, n_frames: usize, data_start_block: u16) -> [u8; BLOCK_SIZE] {
        let mut header = [0u8; BLOCK_SIZE];
        header[0] = 2; // parameter section begins at block 2
        header[1] = HEADER_MAGIC;
        put_u16(&mut header, 2, 0); // no 3D points
        put_u16(&mut header, 4, self.channel_count as u16);
        put_u16(&mut header, 6, 1); // first frame
        put_u16(&mut header, 8, n_frames.max(1) as u16);
        put_u16(&mut header, 10, 0); // max gap
        header[12..16].copy_from_slice(&(-1.0f32).to_le_bytes()); // float data
        put_u16(&mut header, 16, data_start_block);
        put_u16(&mut header, 18, 1); // one analog subframe per frame
        header[20..24].copy_from_slice(&(self.sampling_rate as f32).to_le_bytes());
        header
    }

    fn build_parameter_section(&self) -> Vec<u8> {
        let mut out = vec![1, HEADER_MAGIC, 0, PROCESSOR_INTEL];

        push_group(&mut out, 1, "ANALOG");
        push_group(&mut out, 2, "POINT");
        if self.include_info {
            push_group(&mut out, 3, "INFO");
        }
        push_group(&mut out, 4, "SUBJECTS");

        push_float_param(&mut out, 1, "RATE", &[self.sampling_rate as f32]);
        push_int_param(&mut out, 1, "USED", &[self.channel_count as i16]);
        push_float_param(&mut out, 1, "GEN_SCALE", &[1.0]);
        let labels: Vec<String> = (1..=self.channel_count).map(|i| format!("CH{i}")).collect();
        push_char_param(&mut out, 1, "LABELS", &labels);

        let n_frames = self.samples.first().map(|c| c.len()).unwrap_or(0);
        push_float_param(&mut out, 2, "FRAMES", &[n_frames as f32]);
        push_float_param(&mut out, 2, "RATE", &[self.sampling_rate as f32]);

        if self.include_info {
            if let Some(name) = &self.game_name {
                push_char_param(&mut out, 3, "GAME_NAME", std::slice::from_ref(name));
            }
            if let Some(level) = &self.level {
                push_char_param(&mut out, 3, "GAME_LEVEL", std::slice::from_ref(level));
            }
            if let Some(id) = &self.therapist_id {
                push_char_param(&mut out, 3, "THERAPIST_ID", std::slice::from_ref(id));
            }
            if let Some(time) = &self.time {
                push_char_param(&mut out, 3, "TIME", std::slice::from_ref(time));
            }
            if let Some(score) = self.game_score {
                push_float_param(&mut out, 3, "GAME_SCORE", &[score]);
            }
        }
        if let Some(player) = &self.player_name {
            push_char_param(&mut out, 4, "NAMES", std::slice::from_ref(player));
        }

        out.push(0); // record terminator
        out
    }
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn push_group(out: &mut Vec<u8>, id: u8, name: &str) {
    out.push(name.len() as u8);
    out.push((-(id as i8)) as u8);
    out.extend_from_slice(name.as_bytes());
    // Offset spans the offset word itself plus the description length byte.
    out.extend_from_slice(&3i16.to_le_bytes());
    out.push(0); // no description
}

fn push_param_record(out: &mut Vec<u8>, group_id: u8, name: &str, payload: &[u8]) {
    out.push(name.len() as u8);
    out.push(group_id);
    out.extend_from_slice(name.as_bytes());
    let offset = 2 + payload.len() as i16;
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(payload);
}

fn push_float_param(out: &mut Vec<u8>, group_id: u8, name: &str, values: &[f32]) {
    let mut payload = vec![4u8, if values.len() == 1 { 0 } else { 1 }];
    if values.len() > 1 {
        payload.push(values.len() as u8);
    }
    for v in values {
        payload.extend_from_slice(&v.to_le_bytes());
    }
    payload.push(0); // no description
    push_param_record(out, group_id, name, &payload);
}

fn push_int_param(out: &mut Vec<u8>, group_id: u8, name: &str, values: &[i16]) {
    let mut payload = vec![2u8, if values.len() == 1 { 0 } else { 1 }];
    if values.len() > 1 {
        payload.push(values.len() as u8);
    }
    for v in values {
        payload.extend_from_slice(&v.to_le_bytes());
    }
    payload.push(0);
    push_param_record(out, group_id, name, &payload);
}

fn push_char_param(out: &mut Vec<u8>, group_id: u8, name: &str, strings: &[String]) {
    let width = strings.iter().map(|s| s.len()).max().unwrap_or(0).max(1);
    let mut payload = vec![(-1i8) as u8, 2, width as u8, strings.len() as u8];
    for s in strings {
        let mut bytes = s.clone().into_bytes();
        bytes.resize(width, b' ');
        payload.extend_from_slice(&bytes);
    }
    payload.push(0);
    push_param_record(out, group_id, name, &payload);
}
