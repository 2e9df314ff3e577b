use std::collections::VecDeque;

use serde_json::Value;
use tracing::warn;

use crate::network::chunk_stream::ChunkyInputStream;
use crate::{AppError, AppResult};

use super::json::parse_json_block;
use super::{FrameDecoder, FrameEncoder, FramerConfig, InboundMessage, OutboundMessage};

/// RTCP request verbs.  A request line starting with a number is a message
/// delivery; the named verbs manage the session itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpVerb {
    Start,
    Resume,
    Ack,
    Message,
    End,
    Error,
}

#[derive(Debug, PartialEq)]
enum RequestParseState {
    AwaitingVerb,
    AwaitingMessage,
    Complete,
}

/// An RTCP request descriptor, built up by parsing the request line and, for
/// message deliveries, the JSON message blocks that follow it.
#[derive(Debug)]
pub struct RtcpRequest {
    state: RequestParseState,
    verb: RtcpVerb,
    /// Highest seq number of a message from us the client claims receipt of.
    client_recv_seq_num: u64,
    /// Seq number of the message bundle carried by a message delivery.
    client_send_seq_num: u64,
    session_id: Option<String>,
    error: Option<String>,
    messages: VecDeque<Value>,
}

impl RtcpRequest {
    fn new() -> RtcpRequest {
        RtcpRequest {
            state: RequestParseState::AwaitingVerb,
            verb: RtcpVerb::Error,
            client_recv_seq_num: 0,
            client_send_seq_num: 0,
            session_id: None,
            error: None,
            messages: VecDeque::new(),
        }
    }

    pub fn verb(&self) -> RtcpVerb {
        self.verb
    }

    pub fn client_recv_seq_num(&self) -> u64 {
        self.client_recv_seq_num
    }

    pub fn client_send_seq_num(&self) -> u64 {
        self.client_send_seq_num
    }

    /// Session ID, present only in "resume" requests.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Error tag, present in "error" requests and parse failures.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_complete(&self) -> bool {
        self.state == RequestParseState::Complete
    }

    /// Drain the next message from the delivery bundle, oldest first.
    pub fn next_message(&mut self) -> Option<Value> {
        self.messages.pop_front()
    }

    fn add_message(&mut self, message: Value) {
        self.messages.push_back(message);
        self.state = RequestParseState::Complete;
    }

    fn note_problem(&mut self, problem: String) {
        self.error = Some(problem);
        self.verb = RtcpVerb::Error;
        self.state = RequestParseState::Complete;
    }

    fn fail(&mut self, error: &str) {
        self.verb = RtcpVerb::Error;
        self.error = Some(error.to_string());
        self.state = RequestParseState::Complete;
    }

    /// Parse an RTCP request line, extracting the verb and its parameters.
    /// The message bundle of a delivery is parsed separately by the framer.
    fn parse_request_line(&mut self, line: &str) {
        let frags: Vec<&str> = line.trim().split_whitespace().collect();
        let verb = frags[0];
        self.state = RequestParseState::Complete;
        match verb {
            "start" => {
                self.verb = RtcpVerb::Start;
                if frags.len() != 1 {
                    self.fail("invalid start request");
                }
            }
            "resume" => {
                self.verb = RtcpVerb::Resume;
                if frags.len() != 3 {
                    self.fail("invalid resume request");
                } else {
                    self.session_id = Some(frags[1].to_string());
                    match frags[2].parse() {
                        Ok(num) => self.client_recv_seq_num = num,
                        Err(_) => self.fail("invalid resume request"),
                    }
                }
            }
            "ack" => {
                self.verb = RtcpVerb::Ack;
                if frags.len() != 2 {
                    self.fail("invalid ack request");
                } else {
                    match frags[1].parse() {
                        Ok(num) => self.client_recv_seq_num = num,
                        Err(_) => self.fail("invalid ack request"),
                    }
                }
            }
            "end" => {
                self.verb = RtcpVerb::End;
                if frags.len() != 2 {
                    self.fail("invalid end request");
                } else {
                    match frags[1].parse() {
                        Ok(num) => self.client_recv_seq_num = num,
                        Err(_) => self.fail("invalid end request"),
                    }
                }
            }
            "error" => {
                self.verb = RtcpVerb::Error;
                self.error = if frags.len() != 2 {
                    Some("invalid error request".to_string())
                } else {
                    Some(format!("client reported error: {}", frags[1]))
                };
            }
            number => match number.parse() {
                Ok(seq) => {
                    self.verb = RtcpVerb::Message;
                    self.client_send_seq_num = seq;
                    if frags.len() != 2 {
                        self.fail("invalid message request");
                    } else {
                        match frags[1].parse() {
                            Ok(num) => self.client_recv_seq_num = num,
                            Err(_) => self.fail("invalid message request"),
                        }
                    }
                    if self.verb == RtcpVerb::Message {
                        self.state = RequestParseState::AwaitingMessage;
                    }
                }
                Err(_) => {
                    self.fail(&format!("invalid RTCP verb {}", number));
                }
            },
        }
    }
}

#[derive(Debug, PartialEq)]
enum RtcpParseStage {
    Request,
    Messages,
}

/// Decoder for RTCP connections: one request line, then (for message
/// deliveries only) blank-line-delimited JSON blocks exactly as the plain
/// JSON framer reads them.
pub struct RtcpFrameDecoder {
    input: ChunkyInputStream,
    stage: RtcpParseStage,
    request: RtcpRequest,
    msg_buffer: String,
    cfg: FramerConfig,
}

impl RtcpFrameDecoder {
    pub fn new(cfg: FramerConfig) -> RtcpFrameDecoder {
        RtcpFrameDecoder {
            input: ChunkyInputStream::new(),
            stage: RtcpParseStage::Request,
            request: RtcpRequest::new(),
            msg_buffer: String::with_capacity(1000),
            cfg,
        }
    }

    fn finish_request(&mut self, out: &mut Vec<InboundMessage>) {
        let request = std::mem::replace(&mut self.request, RtcpRequest::new());
        out.push(InboundMessage::Rtcp(request));
        self.stage = RtcpParseStage::Request;
    }
}

impl FrameDecoder for RtcpFrameDecoder {
    fn receive_bytes(&mut self, data: &[u8]) -> AppResult<Vec<InboundMessage>> {
        self.input.add_buffer(data);
        let mut out = Vec::new();

        loop {
            match self.stage {
                RtcpParseStage::Request => {
                    let line = match self.input.read_ascii_line()? {
                        Some(line) => line,
                        None => return Ok(out),
                    };
                    if !line.is_empty() {
                        self.request.parse_request_line(&line);
                        if self.request.is_complete() {
                            self.finish_request(&mut out);
                        } else {
                            self.stage = RtcpParseStage::Messages;
                        }
                    }
                }
                RtcpParseStage::Messages => {
                    let line = match self.input.read_utf8_line()? {
                        Some(line) => line,
                        None => return Ok(out),
                    };
                    if line.is_empty() {
                        let mut parsed = Vec::new();
                        parse_json_block(&self.msg_buffer, self.cfg.debug_replies, &mut parsed);
                        self.msg_buffer.clear();
                        for message in parsed {
                            match message {
                                InboundMessage::Json(value) => self.request.add_message(value),
                                InboundMessage::Problem(problem) => {
                                    self.request.note_problem(problem)
                                }
                                _ => unreachable!("json block parses to json or problem"),
                            }
                        }
                        if !self.request.is_complete() {
                            // a bundle that produced nothing can never
                            // complete; answer it as an error
                            warn!("empty or unparseable RTCP message bundle");
                            self.request.note_problem("empty message bundle".to_string());
                        }
                        self.finish_request(&mut out);
                    } else if self.msg_buffer.len() + line.len() > self.cfg.max_msg_length {
                        return Err(AppError::MessageTooLarge(format!(
                            "input too large (limit {} bytes)",
                            self.cfg.max_msg_length
                        )));
                    } else {
                        self.msg_buffer.push(' ');
                        self.msg_buffer.push_str(&line);
                    }
                }
            }
        }
    }
}

/// Encoder for RTCP connections.  Everything sent is a pre-formatted reply
/// string by the time it reaches the framer; output framing is just UTF-8
/// encoding.
pub struct RtcpFrameEncoder;

impl FrameEncoder for RtcpFrameEncoder {
    fn produce_bytes(&self, message: &OutboundMessage) -> AppResult<Vec<u8>> {
        match message {
            OutboundMessage::Text(text) => Ok(text.as_bytes().to_vec()),
            other => Err(AppError::UnwritableMessage(format!("{:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn rtcp_requests(messages: Vec<InboundMessage>) -> Vec<RtcpRequest> {
        messages
            .into_iter()
            .map(|m| match m {
                InboundMessage::Rtcp(r) => r,
                other => panic!("unexpected message {:?}", other),
            })
            .collect()
    }

    #[test]
    fn start_request_completes_on_its_line_alone() {
        let mut decoder = RtcpFrameDecoder::new(FramerConfig::default());
        let requests = rtcp_requests(decoder.receive_bytes(b"start\n").unwrap());
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].verb(), RtcpVerb::Start);
    }

    #[test]
    fn resume_request_carries_session_and_seq() {
        let mut decoder = RtcpFrameDecoder::new(FramerConfig::default());
        let requests = rtcp_requests(decoder.receive_bytes(b"resume 12345 7\n").unwrap());
        assert_eq!(requests[0].verb(), RtcpVerb::Resume);
        assert_eq!(requests[0].session_id(), Some("12345"));
        assert_eq!(requests[0].client_recv_seq_num(), 7);
    }

    #[test]
    fn message_delivery_reads_json_bundle() {
        let mut decoder = RtcpFrameDecoder::new(FramerConfig::default());
        let wire = b"1 0\n{\"op\":\"move\"}\n{\"op\":\"look\"}\n\n";
        let mut requests = rtcp_requests(decoder.receive_bytes(wire).unwrap());
        assert_eq!(requests.len(), 1);
        let request = &mut requests[0];
        assert_eq!(request.verb(), RtcpVerb::Message);
        assert_eq!(request.client_send_seq_num(), 1);
        assert_eq!(request.client_recv_seq_num(), 0);
        assert_eq!(request.next_message(), Some(json!({"op": "move"})));
        assert_eq!(request.next_message(), Some(json!({"op": "look"})));
        assert_eq!(request.next_message(), None);
    }

    #[test]
    fn message_delivery_split_mid_bundle_resumes() {
        let wire = b"3 1\n{\"op\":\"a\"}\n\n";
        for split in 1..wire.len() {
            let mut decoder = RtcpFrameDecoder::new(FramerConfig::default());
            let mut got = rtcp_requests(decoder.receive_bytes(&wire[..split]).unwrap());
            got.extend(rtcp_requests(decoder.receive_bytes(&wire[split..]).unwrap()));
            assert_eq!(got.len(), 1, "split {}", split);
            assert_eq!(got[0].client_send_seq_num(), 3, "split {}", split);
        }
    }

    #[test]
    fn malformed_verb_becomes_error_request() {
        let mut decoder = RtcpFrameDecoder::new(FramerConfig::default());
        let requests = rtcp_requests(decoder.receive_bytes(b"bogus stuff\n").unwrap());
        assert_eq!(requests[0].verb(), RtcpVerb::Error);
        assert!(requests[0].error().unwrap().contains("invalid RTCP verb"));
    }

    #[test]
    fn ack_request_parses_seq() {
        let mut decoder = RtcpFrameDecoder::new(FramerConfig::default());
        let requests = rtcp_requests(decoder.receive_bytes(b"ack 42\n").unwrap());
        assert_eq!(requests[0].verb(), RtcpVerb::Ack);
        assert_eq!(requests[0].client_recv_seq_num(), 42);
    }

    #[test]
    fn consecutive_requests_parse_in_order() {
        let mut decoder = RtcpFrameDecoder::new(FramerConfig::default());
        let wire = b"start\n1 0\n{\"a\":1}\n\nack 1\n";
        let requests = rtcp_requests(decoder.receive_bytes(wire).unwrap());
        let verbs: Vec<RtcpVerb> = requests.iter().map(|r| r.verb()).collect();
        assert_eq!(verbs, vec![RtcpVerb::Start, RtcpVerb::Message, RtcpVerb::Ack]);
    }
}
