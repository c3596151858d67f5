use serde_json::Value;

/// NDJSON 解码器：跨 chunk 缓冲，每个完整的非空行产出一个 JSON 值
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Value>, serde_json::Error> {
        self.buffer.extend_from_slice(chunk);

        let mut values = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(value) = parse_line(&line)? {
                values.push(value);
            }
        }
        Ok(values)
    }

    /// 处理末尾没有换行的最后一行
    pub fn finish(&mut self) -> Result<Option<Value>, serde_json::Error> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn parse_line(line: &[u8]) -> Result<Option<Value>, serde_json::Error> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn splits_complete_lines() {
        let mut decoder = NdjsonDecoder::new();
        let values = decoder
            .push(b"{\"a\":1}\n{\"a\":2}\n")
            .unwrap();
        assert_eq!(values, vec![json!({"a": 1}), json!({"a": 2})]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn buffers_across_chunk_boundaries() {
        let mut decoder = NdjsonDecoder::new();
        assert!(decoder.push(b"{\"message\":{\"con").unwrap().is_empty());
        assert!(decoder.push(b"tent\":\"hi\"}").unwrap().is_empty());
        let values = decoder.push(b"}\r\n\n{\"done\"").unwrap();
        assert_eq!(values, vec![json!({"message": {"content": "hi"}})]);

        assert!(decoder.push(b":true}").unwrap().is_empty());
        assert_eq!(decoder.finish().unwrap(), Some(json!({"done": true})));
        assert_eq!(decoder.finish().unwrap(), None);
    }

    #[test]
    fn multibyte_split_is_preserved() {
        let line = "{\"t\":\"你好\"}\n".as_bytes();
        let mut decoder = NdjsonDecoder::new();
        // 在多字节字符中间切开
        assert!(decoder.push(&line[..8]).unwrap().is_empty());
        let values = decoder.push(&line[8..]).unwrap();
        assert_eq!(values, vec![json!({"t": "你好"})]);
    }

    #[test]
    fn invalid_line_is_an_error() {
        let mut decoder = NdjsonDecoder::new();
        assert!(decoder.push(b"not json\n").is_err());
    }
}
