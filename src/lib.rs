pub mod central;
pub mod config;
pub mod link;
pub mod uplink;

/// Render bytes the way the firmware diagnostics do: `0x01 0x02 ...`.
pub fn hex_dump(b: &[u8]) -> String {
    let mut res = String::with_capacity(b.len() * 5);
    for (idx, byte) in b.iter().enumerate() {
        if idx != 0 {
            res.push(' ');
        }
        res.push_str(&format!("0x{byte:02x}"));
    }
    res
}
