//! Extension negotiation and the frame middleware pipeline (RFC 6455 §9).
//!
//! An extension is offered during the handshake, accepted (or not) by the
//! server, and then sits in the frame path: every outbound raw frame passes
//! through [`Extension::encode`] before serialization, and every inbound
//! assembled frame passes through [`Extension::decode`]. Extensions are
//! applied in the order the server accepted them, the same forward order in
//! both directions.

use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::space0,
    combinator::opt,
    multi::{many0, separated_list0},
    sequence::{pair, preceded},
    IResult,
};

use crate::{frame::RawFrame, Result, WebSocketError};

/// A single `key` or `key=value` extension parameter.
pub type Param = (String, Option<String>);

/// A negotiated extension instance holding its per-connection state.
pub trait Extension {
    /// The wire token, e.g. `permessage-deflate`.
    fn name(&self) -> &str;

    /// Reserved header bits this extension claims, as an RSV bitmask
    /// (`0b100` = RSV1). Bits outside the union of claimed bits fail
    /// decoding.
    fn claimed_rsv(&self) -> u8;

    /// Transforms an outbound raw frame before serialization. May set the
    /// bits it claims.
    fn encode(&mut self, frame: RawFrame) -> Result<RawFrame>;

    /// Transforms an inbound, reassembled raw frame. Must clear any claimed
    /// bit it consumed.
    fn decode(&mut self, frame: RawFrame) -> Result<RawFrame>;
}

/// An extension offer sent during the handshake.
///
/// If the server echoes the offer back, [`accept`](ExtensionOffer::accept)
/// instantiates the per-connection state from the parameters the server
/// chose.
pub trait ExtensionOffer {
    /// The wire token to offer.
    fn name(&self) -> &str;

    /// Parameters to attach to the offer, in header order.
    fn params(&self) -> Vec<Param>;

    /// Builds the extension from the server's accepted parameters.
    fn accept(&self, params: &[Param]) -> Result<Box<dyn Extension>>;
}

/// Formats offers into a `Sec-WebSocket-Extensions` header value:
/// `name; key=value; bare_key` entries joined by `, `.
pub(crate) fn format_offers(offers: &[Box<dyn ExtensionOffer>]) -> String {
    let mut out = String::new();
    for (i, offer) in offers.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(offer.name());
        for (key, value) in offer.params() {
            out.push_str("; ");
            out.push_str(&key);
            if let Some(value) = value {
                out.push('=');
                out.push_str(&value);
            }
        }
    }
    out
}

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '-' || c == '_')(input)
}

/// `; key` or `; key=value`
fn param(input: &str) -> IResult<&str, Param> {
    let (input, (key, value)) = preceded(
        pair(space0, tag(";")),
        preceded(space0, pair(token, opt(preceded(tag("="), token)))),
    )(input)?;
    Ok((input, (key.to_owned(), value.map(str::to_owned))))
}

/// `name(; param)*`
fn entry(input: &str) -> IResult<&str, (String, Vec<Param>)> {
    let (input, name) = preceded(space0, token)(input)?;
    let (input, params) = many0(param)(input)?;
    Ok((input, (name.to_owned(), params)))
}

/// Parses a `Sec-WebSocket-Extensions` header value into named parameter
/// lists, preserving the server's order.
pub(crate) fn parse_header(input: &str) -> Result<Vec<(String, Vec<Param>)>> {
    let (rest, entries) = separated_list0(preceded(space0, tag(",")), entry)(input)
        .map_err(|_| WebSocketError::ExtensionsMismatch(input.to_owned()))?;

    if !rest.trim().is_empty() {
        return Err(WebSocketError::ExtensionsMismatch(input.to_owned()));
    }

    Ok(entries)
}

/// Matches the server's accepted extensions against our offers.
///
/// Instantiates each accepted extension with the server-chosen parameters,
/// in the server's order. A name we never offered fails the handshake with
/// `ExtensionsMismatch`. Offers the server did not echo are dropped.
pub(crate) fn negotiate<'a>(
    offers: &[Box<dyn ExtensionOffer>],
    header_values: impl Iterator<Item = &'a str>,
) -> Result<Vec<Box<dyn Extension>>> {
    let mut accepted: Vec<Box<dyn Extension>> = Vec::new();

    for value in header_values {
        for (name, params) in parse_header(value)? {
            let offer = offers
                .iter()
                .find(|offer| offer.name() == name)
                .ok_or_else(|| WebSocketError::ExtensionsMismatch(name.clone()))?;

            log::debug!("negotiated extension {name} with params {params:?}");
            accepted.push(offer.accept(&params)?);
        }
    }

    Ok(accepted)
}
