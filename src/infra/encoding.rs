//! 命令输出解码
//!
//! 远程 shell 不保证输出 UTF-8（中文 Windows/旧发行版常见 GBK），
//! 先按 UTF-8 解码，失败时回退到 GBK。

use encoding_rs::GBK;

/// 解码一行原始字节，去掉行尾 `\r\n`
pub fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    while end > 0 && (raw[end - 1] == b'\n' || raw[end - 1] == b'\r') {
        end -= 1;
    }
    let raw = &raw[..end];
    match std::str::from_utf8(raw) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let (text, _, _) = GBK.decode(raw);
            text.into_owned()
        }
    }
}

/// 解码整段输出（保留换行）
pub fn decode_output(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let (text, _, _) = GBK.decode(raw);
            text.into_owned()
        }
    }
}

/// 按行切分字节流
///
/// SSH 通道的数据块边界与行边界无关，未完成的行保留到下一块。
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一块数据，返回其中完整的行
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&line));
        }
        lines
    }

    /// 流结束时取出最后一个未换行的片段
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(decode_line(&rest))
    }
}
