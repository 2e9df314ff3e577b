use serde_json::Value;
use tracing::warn;

use crate::network::chunk_stream::ChunkyInputStream;
use crate::{AppError, AppResult};

use super::{FrameDecoder, FrameEncoder, FramerConfig, InboundMessage, OutboundMessage};

/// Framer for plain JSON-over-TCP connections.  Messages are blocks of one or
/// more JSON object literals; blocks are separated by a blank line (two
/// consecutive newlines).
pub struct JsonFrameDecoder {
    input: ChunkyInputStream,
    msg_buffer: String,
    cfg: FramerConfig,
}

impl JsonFrameDecoder {
    pub fn new(cfg: FramerConfig) -> JsonFrameDecoder {
        JsonFrameDecoder {
            input: ChunkyInputStream::new(),
            msg_buffer: String::with_capacity(1000),
            cfg,
        }
    }
}

impl FrameDecoder for JsonFrameDecoder {
    fn receive_bytes(&mut self, data: &[u8]) -> AppResult<Vec<InboundMessage>> {
        self.input.add_buffer(data);
        let mut out = Vec::new();
        drive_json_lines(&mut self.input, &mut self.msg_buffer, &self.cfg, &mut out)?;
        Ok(out)
    }
}

/// Line loop shared with the post-handshake phase of the WebSocket decoder:
/// accumulate non-blank lines, and on a blank line parse the accumulated
/// block for JSON messages.
pub(crate) fn drive_json_lines(
    input: &mut ChunkyInputStream,
    msg_buffer: &mut String,
    cfg: &FramerConfig,
    out: &mut Vec<InboundMessage>,
) -> AppResult<()> {
    while let Some(line) = input.read_utf8_line()? {
        if line.is_empty() {
            parse_json_block(msg_buffer, cfg.debug_replies, out);
            msg_buffer.clear();
        } else if msg_buffer.len() + line.len() > cfg.max_msg_length {
            return Err(AppError::MessageTooLarge(format!(
                "input too large (limit {} bytes)",
                cfg.max_msg_length
            )));
        } else {
            msg_buffer.push(' ');
            msg_buffer.push_str(&line);
        }
    }
    Ok(())
}

/// Parse one blank-line-delimited block for complete JSON messages.  A syntax
/// error dismisses the rest of the block: the messages before it are still
/// delivered, and the error itself is delivered as a pseudo-message when
/// debug replies are enabled.
pub(crate) fn parse_json_block(block: &str, debug_replies: bool, out: &mut Vec<InboundMessage>) {
    let mut stream = serde_json::Deserializer::from_str(block).into_iter::<Value>();
    loop {
        match stream.next() {
            Some(Ok(value)) => out.push(InboundMessage::Json(value)),
            Some(Err(err)) => {
                warn!("syntax error in JSON message: {}", err);
                if debug_replies {
                    out.push(InboundMessage::Problem(err.to_string()));
                }
                break;
            }
            None => break,
        }
    }
}

/// Encoder for plain JSON connections: the canonical message string followed
/// by a blank line.
pub struct JsonFrameEncoder;

impl FrameEncoder for JsonFrameEncoder {
    fn produce_bytes(&self, message: &OutboundMessage) -> AppResult<Vec<u8>> {
        let text = match message {
            OutboundMessage::Json(value) => value.to_string(),
            OutboundMessage::Text(text) => text.clone(),
            other => {
                return Err(AppError::UnwritableMessage(format!("{:?}", other)));
            }
        };
        let mut bytes = text.into_bytes();
        bytes.extend_from_slice(b"\n\n");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn collect_json(messages: Vec<InboundMessage>) -> Vec<Value> {
        messages
            .into_iter()
            .map(|m| match m {
                InboundMessage::Json(v) => v,
                other => panic!("unexpected message {:?}", other),
            })
            .collect()
    }

    #[test]
    fn one_block_one_message() {
        let mut decoder = JsonFrameDecoder::new(FramerConfig::default());
        let messages = decoder.receive_bytes(b"{\"op\":\"hello\"}\n\n").unwrap();
        assert_eq!(collect_json(messages), vec![json!({"op": "hello"})]);
    }

    #[test]
    fn split_input_delivers_same_messages_as_undivided() {
        let wire = b"{\"op\":\"one\"}\n{\"op\":\"two\"}\n\n{\"op\":\"three\"}\n\n";

        let mut whole = JsonFrameDecoder::new(FramerConfig::default());
        let expected = collect_json(whole.receive_bytes(wire).unwrap());
        assert_eq!(expected.len(), 3);

        for split in 1..wire.len() {
            let mut decoder = JsonFrameDecoder::new(FramerConfig::default());
            let mut got = collect_json(decoder.receive_bytes(&wire[..split]).unwrap());
            got.extend(collect_json(decoder.receive_bytes(&wire[split..]).unwrap()));
            assert_eq!(got, expected, "messages differ at split {}", split);
        }
    }

    #[test]
    fn parse_error_is_dismissed_silently_by_default() {
        let mut decoder = JsonFrameDecoder::new(FramerConfig::default());
        let messages = decoder.receive_bytes(b"{not json at all\n\n").unwrap();
        assert!(messages.is_empty());

        // the stream keeps working for whatever follows
        let messages = decoder.receive_bytes(b"{\"op\":\"after\"}\n\n").unwrap();
        assert_eq!(collect_json(messages), vec![json!({"op": "after"})]);
    }

    #[test]
    fn parse_error_surfaces_in_debug_mode() {
        let cfg = FramerConfig {
            debug_replies: true,
            ..FramerConfig::default()
        };
        let mut decoder = JsonFrameDecoder::new(cfg);
        let messages = decoder.receive_bytes(b"{broken\n\n").unwrap();
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], InboundMessage::Problem(_)));
    }

    #[test]
    fn oversized_message_is_fatal() {
        let cfg = FramerConfig {
            max_msg_length: 16,
            ..FramerConfig::default()
        };
        let mut decoder = JsonFrameDecoder::new(cfg);
        let result = decoder.receive_bytes(b"{\"data\":\"xxxxxxxxxxxxxxxxxxxxxxxx\"}\n\n");
        assert!(matches!(result, Err(AppError::MessageTooLarge(_))));
    }

    #[test]
    fn encoder_appends_blank_line() {
        let encoder = JsonFrameEncoder;
        let bytes = encoder
            .produce_bytes(&OutboundMessage::Json(json!({"a": 1})))
            .unwrap();
        assert_eq!(bytes, b"{\"a\":1}\n\n".to_vec());
    }
}
