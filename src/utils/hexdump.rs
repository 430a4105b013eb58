//! 十六进制转储

/// 每行 16 字节，左侧为起始地址
pub fn hexdump(base: u64, data: &[u8]) -> String {
    let mut out = String::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        let addr = base.wrapping_add((i * 16) as u64);
        let hex = hex::encode(chunk);
        let spaced: Vec<&str> = (0..hex.len())
            .step_by(2)
            .map(|j| &hex[j..j + 2])
            .collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        out.push_str(&format!("{:#012x}  {:<47}  {}\n", addr, spaced.join(" "), ascii));
    }
    out
}
