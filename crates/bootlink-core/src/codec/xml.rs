//! XmlCommand codec.
//!
//! One element per command or response inside a `<data>` root:
//!
//! ```text
//! <?xml version="1.0" encoding="UTF-8"?>
//! <data>
//!   <read id="0x0030" len="16">0000000000...</read>
//! </data>
//! ```
//!
//! The `id` attribute is authoritative; when it is missing the element name
//! is mapped back through the command table. Payload bytes travel as hex
//! text. Whitespace and attribute order are not significant.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use super::{CodecError, Frame};
use crate::protocol::constants::{RESPONSE_FLAG, XML_MAX_PAYLOAD, command_id, command_name};

const ROOT: &[u8] = b"data";
const CLOSE_ROOT: &[u8] = b"</data>";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XmlCodec;

#[derive(Default)]
struct PendingElement {
    command: Option<u32>,
    declared_len: Option<usize>,
    hex: String,
    closed: bool,
}

fn element_name(command: u32) -> &'static str {
    if command & RESPONSE_FLAG != 0 {
        "response"
    } else {
        command_name(command).unwrap_or("cmd")
    }
}

fn parse_number(value: &str) -> Option<u64> {
    let value = value.trim();
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn corrupt(e: impl std::fmt::Display) -> CodecError {
    CodecError::FrameCorruption(e.to_string())
}

impl XmlCodec {
    pub fn encode(&self, command: u32, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        if payload.len() > XML_MAX_PAYLOAD {
            return Err(CodecError::PayloadTooLarge {
                len: payload.len(),
                max: XML_MAX_PAYLOAD,
            });
        }
        let name = element_name(command);
        let text = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<data>\n  <{name} id=\"0x{command:04X}\" len=\"{}\">{}</{name}>\n</data>\n",
            payload.len(),
            hex::encode_upper(payload)
        );
        Ok(text.into_bytes())
    }

    pub fn frame_len(&self, buf: &[u8]) -> Result<Option<usize>, CodecError> {
        if let Some(pos) = buf
            .windows(CLOSE_ROOT.len())
            .position(|w| w == CLOSE_ROOT)
        {
            return Ok(Some(pos + CLOSE_ROOT.len()));
        }
        // Hex doubles the payload; allow generous room for markup.
        if buf.len() > XML_MAX_PAYLOAD * 2 + 4096 {
            return Err(CodecError::FrameCorruption(
                "no closing </data> within maximum frame size".into(),
            ));
        }
        Ok(None)
    }

    fn read_attributes(
        &self,
        element: &BytesStart<'_>,
        pending: &mut PendingElement,
    ) -> Result<(), CodecError> {
        for attr in element.attributes().with_checks(false) {
            let attr = attr.map_err(corrupt)?;
            let value = std::str::from_utf8(attr.value.as_ref()).map_err(corrupt)?;
            match attr.key.as_ref() {
                b"id" => {
                    let id = parse_number(value)
                        .and_then(|v| u32::try_from(v).ok())
                        .ok_or_else(|| corrupt(format!("bad id attribute '{value}'")))?;
                    pending.command = Some(id);
                }
                b"len" => {
                    let len = parse_number(value)
                        .ok_or_else(|| corrupt(format!("bad len attribute '{value}'")))?;
                    pending.declared_len = Some(len as usize);
                }
                _ => {}
            }
        }
        if pending.command.is_none() {
            let name = element.name();
            let name = std::str::from_utf8(name.as_ref()).map_err(corrupt)?;
            pending.command = command_id(name);
        }
        Ok(())
    }

    pub fn decode(&self, frame: &[u8]) -> Result<Frame, CodecError> {
        let mut reader = Reader::from_reader(frame);
        reader.config_mut().trim_text(true);
        let mut buf = Vec::new();

        let mut depth = 0usize;
        let mut seen_root = false;
        let mut root_closed = false;
        let mut pending: Option<PendingElement> = None;

        loop {
            match reader.read_event_into(&mut buf).map_err(corrupt)? {
                Event::Start(element) => {
                    depth += 1;
                    if depth == 1 {
                        if element.name().as_ref() != ROOT {
                            return Err(corrupt("root element is not <data>"));
                        }
                        seen_root = true;
                    } else if depth == 2 && pending.is_none() {
                        let mut p = PendingElement::default();
                        self.read_attributes(&element, &mut p)?;
                        pending = Some(p);
                    }
                }
                Event::Empty(element) => {
                    if depth == 1 && pending.is_none() {
                        let mut p = PendingElement {
                            closed: true,
                            ..Default::default()
                        };
                        self.read_attributes(&element, &mut p)?;
                        pending = Some(p);
                    }
                }
                Event::Text(text) => {
                    if depth == 2
                        && let Some(p) = pending.as_mut()
                    {
                        let text = std::str::from_utf8(text.as_ref()).map_err(corrupt)?;
                        p.hex.extend(text.chars().filter(|c| !c.is_ascii_whitespace()));
                    }
                }
                Event::End(_) => {
                    if depth == 2
                        && let Some(p) = pending.as_mut()
                    {
                        p.closed = true;
                    }
                    if depth == 1 {
                        root_closed = true;
                    }
                    depth = depth.saturating_sub(1);
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        let complete = seen_root
            && root_closed
            && pending.as_ref().map(|p| p.closed).unwrap_or(false);
        if !complete {
            return Err(CodecError::Incomplete { have: frame.len() });
        }
        let Some(p) = pending else {
            return Err(corrupt("no command element"));
        };
        let command = p
            .command
            .ok_or_else(|| corrupt("command element has no id and unknown name"))?;
        let payload = hex::decode(&p.hex).map_err(corrupt)?;
        if let Some(len) = p.declared_len
            && len != payload.len()
        {
            return Err(corrupt(format!(
                "len attribute {len} does not match {} payload bytes",
                payload.len()
            )));
        }
        Ok(Frame::new(command, payload))
    }
}
