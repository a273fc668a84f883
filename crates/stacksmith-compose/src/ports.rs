//! Port-entry grammar using `nom`.
//!
//! Classifies the short-syntax port strings found in service fragments.
//! Only the exact numeric `host:container[/protocol]` form is analyzable
//! for host-port conflicts; container-only, ranged, IP-scoped, and
//! placeholder forms are passed through untouched, and anything else is
//! malformed.

use std::fmt;

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, digit1},
    combinator::{all_consuming, map, map_res, opt, value, verify},
    sequence::preceded,
};

/// Transport protocol of a published port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TCP (the compose default when no protocol suffix is present).
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// An analyzable host-to-container port binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortBinding {
    /// Host port, externally visible.
    pub host: u16,
    /// Container port.
    pub container: u16,
    /// Transport protocol.
    pub protocol: Protocol,
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)?;
        if self.protocol == Protocol::Udp {
            write!(f, "/udp")?;
        }
        Ok(())
    }
}

/// Classification of a short-syntax port entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortForm {
    /// Exact numeric `host:container[/protocol]` binding.
    Binding(PortBinding),
    /// A recognized form without an analyzable host port (container-only,
    /// range, IP-scoped, or placeholder). Preserved byte-for-byte.
    Passthrough,
    /// Not a recognizable port entry at all.
    Malformed,
}

fn port_number(input: &str) -> IResult<&str, u16> {
    verify(map_res(digit1, str::parse::<u16>), |p: &u16| *p > 0).parse(input)
}

fn protocol(input: &str) -> IResult<&str, Protocol> {
    preceded(
        char('/'),
        alt((value(Protocol::Tcp, tag("tcp")), value(Protocol::Udp, tag("udp")))),
    )
    .parse(input)
}

fn binding(input: &str) -> IResult<&str, PortBinding> {
    let (input, host) = port_number(input)?;
    let (input, _) = char(':')(input)?;
    let (input, container) = port_number(input)?;
    let (input, proto) = opt(protocol).parse(input)?;
    Ok((
        input,
        PortBinding {
            host,
            container,
            protocol: proto.unwrap_or_default(),
        },
    ))
}

fn container_only(input: &str) -> IResult<&str, ()> {
    let (input, _) = port_number(input)?;
    let (input, _) = opt(protocol).parse(input)?;
    Ok((input, ()))
}

fn port_range(input: &str) -> IResult<&str, ()> {
    let (input, _) = port_number(input)?;
    let (input, _) = char('-')(input)?;
    let (input, _) = port_number(input)?;
    Ok((input, ()))
}

fn range_form(input: &str) -> IResult<&str, ()> {
    let (input, _) = port_range(input)?;
    let (input, _) = opt(preceded(char(':'), port_range)).parse(input)?;
    let (input, _) = opt(protocol).parse(input)?;
    Ok((input, ()))
}

fn ip_octet(input: &str) -> IResult<&str, ()> {
    value((), map_res(digit1, str::parse::<u8>)).parse(input)
}

fn ipv4(input: &str) -> IResult<&str, ()> {
    let (input, ()) = ip_octet(input)?;
    let (input, _) = char('.')(input)?;
    let (input, ()) = ip_octet(input)?;
    let (input, _) = char('.')(input)?;
    let (input, ()) = ip_octet(input)?;
    let (input, _) = char('.')(input)?;
    let (input, ()) = ip_octet(input)?;
    Ok((input, ()))
}

fn range_or_port(input: &str) -> IResult<&str, ()> {
    alt((port_range, map(port_number, |_| ()))).parse(input)
}

fn ip_scoped(input: &str) -> IResult<&str, ()> {
    let (input, ()) = ipv4(input)?;
    let (input, _) = char(':')(input)?;
    let (input, ()) = range_or_port(input)?;
    let (input, _) = opt(preceded(char(':'), range_or_port)).parse(input)?;
    let (input, _) = opt(protocol).parse(input)?;
    Ok((input, ()))
}

/// Returns true when the entry looks like an unresolved placeholder form,
/// e.g. `"${PG_PORT}:5432"` or `"${PG_PORT:-5432}:5432"`.
fn is_placeholder_form(entry: &str) -> bool {
    entry.contains("${")
        && entry
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "${}:-_./".contains(c))
}

/// Classifies a short-syntax port entry.
#[must_use]
pub fn classify(entry: &str) -> PortForm {
    let text = entry.trim();
    if text.is_empty() {
        return PortForm::Malformed;
    }
    if let Ok((_, parsed)) = all_consuming(binding).parse(text) {
        return PortForm::Binding(parsed);
    }
    let passthrough = all_consuming(container_only).parse(text).is_ok()
        || all_consuming(range_form).parse(text).is_ok()
        || all_consuming(ip_scoped).parse(text).is_ok()
        || is_placeholder_form(text);
    if passthrough {
        PortForm::Passthrough
    } else {
        PortForm::Malformed
    }
}

/// Parses an entry into a [`PortBinding`] when it has the exact numeric
/// `host:container[/protocol]` form.
#[must_use]
pub fn parse_binding(entry: &str) -> Option<PortBinding> {
    match classify(entry) {
        PortForm::Binding(parsed) => Some(parsed),
        _ => None,
    }
}

/// Rewrites the host port of a binding entry, preserving everything after
/// the first `:` byte-for-byte (container port, protocol suffix).
///
/// Returns `None` when the entry is not an analyzable binding or its host
/// port is not `old`.
#[must_use]
pub fn rewrite_host(entry: &str, old: u16, new: u16) -> Option<String> {
    let text = entry.trim();
    let parsed = parse_binding(text)?;
    if parsed.host != old {
        return None;
    }
    let idx = text.find(':')?;
    Some(format!("{new}{}", &text[idx..]))
}

/// Strips the host publication from a binding entry, leaving the
/// container-only form (`"5432:5432/udp"` becomes `"5432/udp"`).
///
/// Returns `None` when the entry is not an analyzable binding.
#[must_use]
pub fn strip_host(entry: &str) -> Option<String> {
    let text = entry.trim();
    let _ = parse_binding(text)?;
    let idx = text.find(':')?;
    Some(text[idx + 1..].to_owned())
}
