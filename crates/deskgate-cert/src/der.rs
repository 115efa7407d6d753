//! Hand-written DER for the smartcard logon certificate extensions
//!
//! Windows smartcard logon needs two things common certificate builders can't
//! express: an Extended Key Usage carrying the Smartcard Logon OID, and a
//! Subject Alternative Name holding the user principal name as an `otherName`.
//! Both extension values are assembled here byte by byte:
//!
//! ```text
//! ExtKeyUsageSyntax ::= SEQUENCE SIZE (1..MAX) OF KeyPurposeId
//!
//! GeneralNames ::= SEQUENCE SIZE (1..MAX) OF GeneralName
//! GeneralName  ::= CHOICE { otherName [0] OtherName, ... }
//! OtherName    ::= SEQUENCE { type-id OBJECT IDENTIFIER,
//!                             value   [0] EXPLICIT ANY DEFINED BY type-id }
//! ```
//!
//! `otherName` is implicitly tagged, so its SEQUENCE tag is replaced by `[0]`.
//! The UPN value is a UTF8String wrapped in the explicit `[0]`.

use thiserror::Error;

pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_OID: u8 = 0x06;
pub const TAG_UTF8_STRING: u8 = 0x0c;
/// Context-specific `[0]`, constructed
pub const TAG_CONTEXT_0: u8 = 0xa0;

pub const OID_EXTENDED_KEY_USAGE: &[u64] = &[2, 5, 29, 37];
pub const OID_SUBJECT_ALT_NAME: &[u64] = &[2, 5, 29, 17];
pub const OID_CLIENT_AUTH: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 3, 2];
pub const OID_SMARTCARD_LOGON: &[u64] = &[1, 3, 6, 1, 4, 1, 311, 20, 2, 2];
pub const OID_USER_PRINCIPAL_NAME: &[u64] = &[1, 3, 6, 1, 4, 1, 311, 20, 2, 3];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DerError {
    #[error("Invalid object identifier: {0}")]
    InvalidOid(String),

    #[error("Unexpected tag: expected {expected:#04x}, found {found:#04x}")]
    UnexpectedTag { expected: u8, found: u8 },

    #[error("Truncated DER input")]
    Truncated,

    #[error("Unsupported DER length encoding")]
    UnsupportedLength,

    #[error("Trailing data after {0}")]
    TrailingData(&'static str),

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
}

/// Render an OID as dotted decimal
pub fn format_oid(arcs: &[u64]) -> String {
    arcs.iter()
        .map(|arc| arc.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

fn encode_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    let significant = &bytes[skip..];
    out.push(0x80 | significant.len() as u8);
    out.extend_from_slice(significant);
}

/// Encode a single tag-length-value element
pub fn encode_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);
    encode_length(content.len(), &mut out);
    out.extend_from_slice(content);
    out
}

fn encode_base128(mut value: u64, out: &mut Vec<u8>) {
    let mut groups = [0u8; 10];
    let mut start = groups.len();
    loop {
        start -= 1;
        groups[start] = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    let last = groups.len() - 1;
    for (idx, group) in groups.iter().enumerate().skip(start) {
        out.push(if idx == last { *group } else { *group | 0x80 });
    }
}

/// Encode an OBJECT IDENTIFIER element
pub fn encode_oid(arcs: &[u64]) -> Result<Vec<u8>, DerError> {
    let invalid = || DerError::InvalidOid(format_oid(arcs));
    if arcs.len() < 2 || arcs[0] > 2 || (arcs[0] < 2 && arcs[1] >= 40) {
        return Err(invalid());
    }
    let first = (arcs[0] * 40).checked_add(arcs[1]).ok_or_else(invalid)?;

    let mut content = Vec::with_capacity(arcs.len() * 2);
    encode_base128(first, &mut content);
    for arc in &arcs[2..] {
        encode_base128(*arc, &mut content);
    }
    Ok(encode_tlv(TAG_OID, &content))
}

/// Value of the Extended Key Usage extension: Client Authentication, then
/// Smartcard Logon
pub fn extended_key_usage_value() -> Result<Vec<u8>, DerError> {
    let mut purposes = encode_oid(OID_CLIENT_AUTH)?;
    purposes.extend(encode_oid(OID_SMARTCARD_LOGON)?);
    Ok(encode_tlv(TAG_SEQUENCE, &purposes))
}

/// Value of the Subject Alternative Name extension carrying a single UPN
/// `otherName`
pub fn upn_subject_alt_name_value(upn: &str) -> Result<Vec<u8>, DerError> {
    let value = encode_tlv(
        TAG_CONTEXT_0,
        &encode_tlv(TAG_UTF8_STRING, upn.as_bytes()),
    );
    let mut other_name = encode_oid(OID_USER_PRINCIPAL_NAME)?;
    other_name.extend(value);
    Ok(encode_tlv(
        TAG_SEQUENCE,
        &encode_tlv(TAG_CONTEXT_0, &other_name),
    ))
}

/// A decoded tag-length-value element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub content: &'a [u8],
}

/// Read one element, returning it and the remaining input
pub fn read_tlv(input: &[u8]) -> Result<(Tlv<'_>, &[u8]), DerError> {
    let (&tag, rest) = input.split_first().ok_or(DerError::Truncated)?;
    let (&first, rest) = rest.split_first().ok_or(DerError::Truncated)?;

    let (len, rest) = if first < 0x80 {
        (first as usize, rest)
    } else {
        let count = (first & 0x7f) as usize;
        if count == 0 || count > std::mem::size_of::<usize>() {
            return Err(DerError::UnsupportedLength);
        }
        if rest.len() < count {
            return Err(DerError::Truncated);
        }
        let len = rest[..count]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (len, &rest[count..])
    };

    if rest.len() < len {
        return Err(DerError::Truncated);
    }
    Ok((
        Tlv {
            tag,
            content: &rest[..len],
        },
        &rest[len..],
    ))
}

fn expect_tlv(input: &[u8], tag: u8) -> Result<(&[u8], &[u8]), DerError> {
    let (tlv, rest) = read_tlv(input)?;
    if tlv.tag != tag {
        return Err(DerError::UnexpectedTag {
            expected: tag,
            found: tlv.tag,
        });
    }
    Ok((tlv.content, rest))
}

/// Decode the content octets of an OBJECT IDENTIFIER
pub fn decode_oid(content: &[u8]) -> Result<Vec<u64>, DerError> {
    let invalid = || DerError::InvalidOid(format!("{:02x?}", content));
    if content.is_empty() || content[content.len() - 1] & 0x80 != 0 {
        return Err(invalid());
    }

    let mut arcs = Vec::new();
    let mut value: u64 = 0;
    for byte in content {
        if value > (u64::MAX >> 7) {
            return Err(invalid());
        }
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 != 0 {
            continue;
        }
        if arcs.is_empty() {
            match value {
                0..=39 => arcs.extend([0, value]),
                40..=79 => arcs.extend([1, value - 40]),
                _ => arcs.extend([2, value - 80]),
            }
        } else {
            arcs.push(value);
        }
        value = 0;
    }
    Ok(arcs)
}

/// Decode an Extended Key Usage extension value into its purpose OIDs, in
/// encoded order
pub fn decode_extended_key_usage(value: &[u8]) -> Result<Vec<Vec<u64>>, DerError> {
    let (mut purposes, rest) = expect_tlv(value, TAG_SEQUENCE)?;
    if !rest.is_empty() {
        return Err(DerError::TrailingData("ExtKeyUsageSyntax"));
    }

    let mut oids = Vec::new();
    while !purposes.is_empty() {
        let (oid, rest) = expect_tlv(purposes, TAG_OID)?;
        oids.push(decode_oid(oid)?);
        purposes = rest;
    }
    Ok(oids)
}

/// A decoded `otherName` whose value is a UTF8String
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtherName {
    pub type_id: Vec<u64>,
    pub value: String,
}

/// One entry of a GeneralNames sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneralName {
    OtherName(OtherName),
    /// Any other choice, kept as its raw tag and content
    Unsupported { tag: u8, content: Vec<u8> },
}

fn decode_other_name(content: &[u8]) -> Result<OtherName, DerError> {
    let (oid, rest) = expect_tlv(content, TAG_OID)?;
    let (explicit, rest) = expect_tlv(rest, TAG_CONTEXT_0)?;
    if !rest.is_empty() {
        return Err(DerError::TrailingData("OtherName"));
    }
    let (utf8, trailing) = expect_tlv(explicit, TAG_UTF8_STRING)?;
    if !trailing.is_empty() {
        return Err(DerError::TrailingData("OtherName value"));
    }
    let value = std::str::from_utf8(utf8)
        .map_err(|_| DerError::InvalidUtf8("OtherName value"))?
        .to_string();

    Ok(OtherName {
        type_id: decode_oid(oid)?,
        value,
    })
}

/// Decode a Subject Alternative Name extension value
pub fn decode_subject_alt_name(value: &[u8]) -> Result<Vec<GeneralName>, DerError> {
    let (mut names, rest) = expect_tlv(value, TAG_SEQUENCE)?;
    if !rest.is_empty() {
        return Err(DerError::TrailingData("GeneralNames"));
    }

    let mut decoded = Vec::new();
    while !names.is_empty() {
        let (tlv, rest) = read_tlv(names)?;
        decoded.push(match tlv.tag {
            TAG_CONTEXT_0 => GeneralName::OtherName(decode_other_name(tlv.content)?),
            tag => GeneralName::Unsupported {
                tag,
                content: tlv.content.to_vec(),
            },
        });
        names = rest;
    }
    Ok(decoded)
}
