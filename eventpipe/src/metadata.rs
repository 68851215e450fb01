//! Event metadata blob encoding (§6 "Event metadata blob"). A blob
//! describes one event's shape to a reader: its name, keywords, version,
//! level, and parameter list. v1 is used whenever every parameter is a
//! scalar and no opcode is set; v2 is used the moment an array parameter
//! or a non-zero opcode appears.

use eventpipe_wire::{MetadataTag, ParameterTypeCode};

pub struct ParameterDescriptor {
    pub name: String,
    pub type_code: ParameterTypeCode,
    pub is_array: bool,
}

impl ParameterDescriptor {
    pub fn new(name: impl Into<String>, type_code: ParameterTypeCode) -> Self {
        ParameterDescriptor {
            name: name.into(),
            type_code,
            is_array: false,
        }
    }

    pub fn array(name: impl Into<String>, type_code: ParameterTypeCode) -> Self {
        ParameterDescriptor {
            name: name.into(),
            type_code,
            is_array: true,
        }
    }
}

pub(crate) fn utf16_nul(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2 + 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

/// Encodes an event's metadata blob. Picks v1 or v2 per the rule above.
pub fn encode_event_metadata(
    event_id: u32,
    name: &str,
    keywords: i64,
    version: u32,
    level: u32,
    opcode: u8,
    params: &[ParameterDescriptor],
) -> Vec<u8> {
    let needs_v2 = opcode != 0 || params.iter().any(|p| p.is_array);
    let mut buf = Vec::new();
    buf.extend_from_slice(&event_id.to_le_bytes());
    buf.extend_from_slice(&utf16_nul(name));
    buf.extend_from_slice(&keywords.to_le_bytes());
    buf.extend_from_slice(&version.to_le_bytes());
    buf.extend_from_slice(&level.to_le_bytes());

    if !needs_v2 {
        buf.extend_from_slice(&(params.len() as u32).to_le_bytes());
        for p in params {
            buf.extend_from_slice(&(p.type_code as u32).to_le_bytes());
            buf.extend_from_slice(&utf16_nul(&p.name));
        }
        return buf;
    }

    // v2: parameter_count = 0 in the v1 slot, followed by optional tags.
    buf.extend_from_slice(&0u32.to_le_bytes());

    if opcode != 0 {
        let payload = [opcode];
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.push(MetadataTag::Opcode as u8);
        buf.extend_from_slice(&payload);
    }

    if !params.is_empty() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(params.len() as u32).to_le_bytes());
        for p in params {
            let mut field = Vec::new();
            field.extend_from_slice(&utf16_nul(&p.name));
            if p.is_array {
                field.extend_from_slice(&(ParameterTypeCode::Array as u32).to_le_bytes());
            }
            field.extend_from_slice(&(p.type_code as u32).to_le_bytes());
            payload.extend_from_slice(&(field.len() as u32).to_le_bytes());
            payload.extend_from_slice(&field);
        }
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.push(MetadataTag::Parameters as u8);
        buf.extend_from_slice(&payload);
    }

    buf
}

/// Minimal v1 blob with no parameters, used when a provider auto-generates
/// metadata for an event that was added without an explicit blob.
pub fn auto_generate(event_id: u32, name: &str, keywords: i64, version: u32, level: u32) -> Vec<u8> {
    encode_event_metadata(event_id, name, keywords, version, level, 0, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_blob_has_zero_parameters() {
        let blob = auto_generate(42, "Foo", 0x1, 1, 4);
        assert_eq!(blob[0..4], 42u32.to_le_bytes());
    }

    #[test]
    fn array_parameter_forces_v2() {
        let v1 = encode_event_metadata(1, "A", 0, 1, 0, 0, &[ParameterDescriptor::new("x", ParameterTypeCode::Int32)]);
        let v2 = encode_event_metadata(
            1,
            "A",
            0,
            1,
            0,
            0,
            &[ParameterDescriptor::array("x", ParameterTypeCode::Int32)],
        );
        assert_ne!(v1, v2);
    }
}
