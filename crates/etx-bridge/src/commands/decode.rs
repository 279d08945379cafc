//! `decode`: run one hex-encoded frame through the codec.

use serde_json::json;

use etx_bridge_core::codec;

use crate::cli::{DecodeArgs, GlobalOpts};
use crate::error::CliError;
use crate::output;

pub fn handle(args: &DecodeArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let bytes = parse_hex(&args.hex)?;
    let value = if args.metadata {
        let meta = codec::peek_metadata(&bytes).ok_or_else(|| CliError::Decode {
            reason: "missing start marker or header shorter than 15 bytes".into(),
        })?;
        json!({ "dn": meta.dn, "ts": meta.ts })
    } else {
        let frame = codec::parse(&bytes).ok_or_else(|| CliError::Decode {
            reason: describe_rejection(&bytes),
        })?;
        serde_json::to_value(frame)?
    };

    output::print_output(&output::render_json(args.output, &value)?, global.quiet);
    Ok(())
}

/// Accepts `5a5a...`, `5A 5A ...`, `0x5a,0x5a,...`.
fn parse_hex(input: &str) -> Result<Vec<u8>, CliError> {
    let cleaned: String = input
        .split(|c: char| c.is_whitespace() || c == ',' || c == ':')
        .map(|chunk| {
            chunk
                .strip_prefix("0x")
                .or_else(|| chunk.strip_prefix("0X"))
                .unwrap_or(chunk)
        })
        .collect();
    hex::decode(&cleaned).map_err(|e| CliError::Validation {
        field: "hex".into(),
        reason: e.to_string(),
    })
}

fn describe_rejection(bytes: &[u8]) -> String {
    if bytes.len() < codec::MIN_FRAME_LEN {
        return format!(
            "{} bytes is shorter than the {}-byte minimum",
            bytes.len(),
            codec::MIN_FRAME_LEN
        );
    }
    if !bytes.starts_with(&codec::START_MARKER) {
        return "missing start marker".into();
    }
    if !bytes.ends_with(&codec::END_MARKER) {
        return "missing end marker".into();
    }
    match bytes.get(8) {
        Some(&sn) => format!(
            "sn={sn} needs {} bytes, got {}",
            codec::expected_len(sn),
            bytes.len()
        ),
        None => "truncated header".into(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn hex_accepts_common_spellings() {
        assert_eq!(parse_hex("5a5aA5a5").unwrap(), vec![0x5A, 0x5A, 0xA5, 0xA5]);
        assert_eq!(parse_hex("0x5a, 0x5A\n0xa5").unwrap(), vec![0x5A, 0x5A, 0xA5]);
        assert_eq!(parse_hex("5A:5A").unwrap(), vec![0x5A, 0x5A]);
        assert!(parse_hex("5a5").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn rejection_reasons_name_the_problem() {
        assert!(describe_rejection(&[0x5A, 0x5A]).contains("minimum"));

        let mut frame = vec![0u8; codec::MIN_FRAME_LEN];
        assert_eq!(describe_rejection(&frame), "missing start marker");

        frame[..2].copy_from_slice(&codec::START_MARKER);
        assert_eq!(describe_rejection(&frame), "missing end marker");

        let len = frame.len();
        frame[len - 2..].copy_from_slice(&codec::END_MARKER);
        frame[8] = 2;
        assert_eq!(describe_rejection(&frame), "sn=2 needs 61 bytes, got 53");
    }
}
