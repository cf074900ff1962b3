//! Generated protobuf modules
//!
//! build.rs compiles the Meshtastic wire subset under `protos/`; prost emits one file per
//! package (`meshtastic.rs`).

pub mod meshtastic_generated {
    //! Generated Meshtastic protobuf types.
    //! Wrapped in a submodule with broad allow() attributes so the parts of the schema we
    //! only carry for wire compatibility do not produce dead_code noise.
    #[allow(dead_code, unused_imports, unused_variables, unused_mut, unused_macros)]
    #[allow(clippy::all)]
    #[allow(rustdoc::invalid_html_tags)]
    mod inner {
        include!(concat!(env!("OUT_DIR"), "/meshtastic.rs"));
    }
    pub use inner::*;
}

/// Broadcast destination used by Meshtastic for "all nodes".
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

/// Render a node number the way Meshtastic clients display node ids (`!a1b2c3d4`).
pub fn node_id_string(num: u32) -> String {
    format!("!{:08x}", num)
}

/// Parse a node id written as `!a1b2c3d4`, `0xA1B2C3D4` or plain decimal.
pub fn parse_node_id(raw: &str) -> Option<u32> {
    let s = raw.trim();
    if let Some(hex) = s.strip_prefix('!') {
        return u32::from_str_radix(hex, 16).ok();
    }
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16).ok();
    }
    s.parse::<u32>().ok()
}

/// Fresh non-zero packet identifier (0 means "unassigned" on the wire).
pub fn new_packet_id() -> u32 {
    loop {
        let id: u32 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

/// Hardware model enum name (`TBEAM`, `HELTEC_V3`, ...) or `HW_<n>` for values this
/// build does not know.
pub fn hw_model_name(value: i32) -> String {
    meshtastic_generated::HardwareModel::try_from(value)
        .map(|m| m.as_str_name().to_string())
        .unwrap_or_else(|_| format!("HW_{}", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_render_and_parse() {
        assert_eq!(node_id_string(0xab), "!000000ab");
        assert_eq!(parse_node_id("!000000ab"), Some(0xab));
        assert_eq!(parse_node_id("0xA1B2C3D4"), Some(0xA1B2_C3D4));
        assert_eq!(parse_node_id("1234"), Some(1234));
        assert_eq!(parse_node_id("!zz"), None);
        assert_eq!(parse_node_id(""), None);
    }

    #[test]
    fn hw_model_names() {
        assert_eq!(hw_model_name(4), "TBEAM");
        assert_eq!(hw_model_name(43), "HELTEC_V3");
        assert_eq!(hw_model_name(9999), "HW_9999");
        assert_ne!(new_packet_id(), 0);
    }
}
