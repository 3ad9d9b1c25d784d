//! Pure key/DN helpers: canonical DN form and order-preserving key encoding.

use tracing::info;

/// Every directory entry has a distinguished name. The wire protocol does not
/// treat the DN as an attribute, but we do: it is always present and always
/// unique, so records carry it under this name.
pub const DN_ATTRIBUTE: &str = "dn";

/// Return the canonical form of a DN: lower-cased, `\xx` hex escapes
/// unescaped, whitespace around *separator* commas collapsed, and literal `/`
/// replaced with `%2F` so the result is safe as a path segment downstream.
/// Only unescaped commas are separators; an escaped comma and the whitespace
/// around it belong to the attribute value and are preserved.
///
/// A malformed escape never fails the query: the DN falls back to the simple
/// normalization (lower-case, comma-whitespace collapse, `/` replacement) and
/// the anomaly is logged.
#[must_use]
pub fn canonical_dn(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    match unescape_dn(&lowered) {
        Ok(unescaped) => unescaped.replace('/', "%2F"),
        Err(reason) => {
            info!(dn = %lowered, %reason, "potentially invalid LDAP DN, using simple normalization");
            collapse_separator_whitespace(&lowered).replace('/', "%2F")
        }
    }
}

/// Undo RFC 4514 escaping and collapse whitespace around separator commas in
/// one pass: `\` followed by two hex digits becomes that byte (consecutive
/// escaped bytes are decoded together as UTF-8), and `\` followed by a special
/// character becomes the character itself. Whitespace collapse must happen
/// here, while escapes are still visible: once `\,` has been unescaped it is
/// indistinguishable from a separator comma.
fn unescape_dn(dn: &str) -> Result<String, &'static str> {
    let mut out = String::with_capacity(dn.len());
    let mut bytes = Vec::new();
    // Unescaped spaces seen but not yet committed: dropped if a separator
    // comma follows, kept otherwise.
    let mut spaces = 0usize;
    let mut after_separator = false;
    let mut chars = dn.chars().peekable();

    let mut flush = |bytes: &mut Vec<u8>, out: &mut String| -> Result<(), &'static str> {
        if bytes.is_empty() {
            return Ok(());
        }
        let run = std::mem::take(bytes);
        match String::from_utf8(run) {
            Ok(s) => {
                out.push_str(&s);
                Ok(())
            }
            Err(_) => Err("escaped bytes are not valid UTF-8"),
        }
    };

    while let Some(c) = chars.next() {
        if c != '\\' {
            flush(&mut bytes, &mut out)?;
            match c {
                ',' => {
                    spaces = 0;
                    out.push(',');
                    after_separator = true;
                }
                ' ' => {
                    if !after_separator {
                        spaces += 1;
                    }
                }
                other => {
                    out.push_str(&" ".repeat(spaces));
                    spaces = 0;
                    out.push(other);
                    after_separator = false;
                }
            }
            continue;
        }
        match chars.peek().copied() {
            Some(h1) if h1.is_ascii_hexdigit() => {
                chars.next();
                let h2 = chars.next().ok_or("truncated hex escape")?;
                if !h2.is_ascii_hexdigit() {
                    return Err("malformed hex escape");
                }
                let hi = h1.to_digit(16).unwrap_or(0) as u8;
                let lo = h2.to_digit(16).unwrap_or(0) as u8;
                out.push_str(&" ".repeat(spaces));
                spaces = 0;
                after_separator = false;
                bytes.push(hi << 4 | lo);
            }
            Some(special @ (' ' | '"' | '#' | '+' | ',' | ';' | '<' | '=' | '>' | '\\')) => {
                chars.next();
                flush(&mut bytes, &mut out)?;
                out.push_str(&" ".repeat(spaces));
                spaces = 0;
                out.push(special);
                after_separator = false;
            }
            Some(_) => return Err("unrecognized escape"),
            None => return Err("trailing backslash"),
        }
    }
    flush(&mut bytes, &mut out)?;
    out.push_str(&" ".repeat(spaces));
    Ok(out)
}

/// Collapse spaces around `,` separators: `a , b` becomes `a,b`.
fn collapse_separator_whitespace(dn: &str) -> String {
    let mut out = String::with_capacity(dn.len());
    let mut chars = dn.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ',' {
            while out.ends_with(' ') {
                out.pop();
            }
            out.push(',');
            while chars.peek() == Some(&' ') {
                chars.next();
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Encode a record key into a URL-path-safe identifier: lower-case hex of the
/// UTF-8 bytes, two digits per byte, no separators.
///
/// The encoding preserves byte-wise order: if two keys' UTF-8 byte sequences
/// compare in a given order, their encodings compare the same way as strings.
/// This coincides with natural string order for keys using only code points
/// below the surrogate range; ordering for supplementary characters is
/// unspecified.
#[must_use]
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() * 2);
    for byte in key.as_bytes() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
