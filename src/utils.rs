use crate::error::YakNsError;

/// Maximum length of a single DNS label in octets.
pub const MAX_LABEL_LENGTH: usize = 63;
/// Maximum length of a full name in octets.
pub const MAX_NAME_LENGTH: usize = 255;

/// Turn a presentation-format name (`example.com`) into wire format
/// (`[7]example[3]com[0]`).
///
/// If `compress_reference` is set and the name is the same as the reference,
/// emit a compression pointer to `compress_target` instead.
/// Ref [RFC1035 4.1.4](https://www.rfc-editor.org/rfc/rfc1035#section-4.1.4).
pub fn name_as_bytes(
    name: &[u8],
    compress_target: Option<u16>,
    compress_reference: Option<&[u8]>,
) -> Vec<u8> {
    if let (Some(target), Some(reference)) = (compress_target, compress_reference) {
        if reference == name {
            return vec![0xC0 | (target >> 8) as u8, (target & 0xff) as u8];
        }
    }

    let mut result: Vec<u8> = Vec::with_capacity(name.len() + 2);
    if !name.is_empty() {
        for label in name.split(|byte| *byte == b'.') {
            result.push(label.len() as u8);
            result.extend(label);
        }
    }
    // root terminator
    result.push(0);
    result
}

/// Read a wire-format name starting at the front of `buf`, returning the
/// presentation form and the number of bytes consumed (including the
/// terminating zero octet).
///
/// Compression pointers are rejected - questions from clients are sent
/// uncompressed.
pub fn parse_name(buf: &[u8]) -> Result<(String, usize), YakNsError> {
    let mut labels: Vec<String> = vec![];
    let mut pos: usize = 0;
    let mut name_len: usize = 0;

    loop {
        let label_len = *buf
            .get(pos)
            .ok_or_else(|| YakNsError::InvalidValue("name ran past end of buffer".to_string()))?
            as usize;
        if label_len == 0 {
            pos += 1;
            break;
        }
        if label_len > MAX_LABEL_LENGTH {
            return Err(YakNsError::InvalidValue(format!(
                "label length {label_len} is over {MAX_LABEL_LENGTH}"
            )));
        }
        if pos + 1 + label_len > buf.len() {
            return Err(YakNsError::InvalidValue(format!(
                "label length {label_len} runs past end of buffer ({})",
                buf.len()
            )));
        }
        name_len += label_len + 1;
        if name_len > MAX_NAME_LENGTH {
            return Err(YakNsError::InvalidValue(format!(
                "name length over {MAX_NAME_LENGTH} octets"
            )));
        }
        let label = std::str::from_utf8(&buf[pos + 1..pos + 1 + label_len])
            .map_err(|err| YakNsError::InvalidValue(format!("label is not utf-8: {err:?}")))?;
        labels.push(label.to_string());
        pos += 1 + label_len;
    }

    Ok((labels.join("."), pos))
}

/// tests to ensure that no label in the name is longer than 63 octets (bytes)
pub fn check_long_labels(testval: &str) -> bool {
    testval.split('.').any(|x| x.len() > MAX_LABEL_LENGTH)
}

#[test]
fn test_check_long_labels() {
    assert_eq!(false, check_long_labels("hello."));
    assert_eq!(false, check_long_labels("hello.world"));
    assert_eq!(
        true,
        check_long_labels(
            "foo.12345678901234567890123456789012345678901234567890123456789012345678901234567890"
        )
    );
}

#[test]
fn test_name_round_trip() {
    let wire = name_as_bytes(b"cheese.world", None, None);
    assert_eq!(wire, [6, 99, 104, 101, 101, 115, 101, 5, 119, 111, 114, 108, 100, 0]);
    let (name, used) = parse_name(&wire).expect("failed to parse name");
    assert_eq!(name, "cheese.world");
    assert_eq!(used, wire.len());
}
