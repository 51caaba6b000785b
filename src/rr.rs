// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! The textual resource record codec.
//!
//! Every answer Quarry produces passes through a single textual layout,
//! `<name> <ttl> <class> <type> <data>`, which is also the form the
//! degrade cache writes to disk. [`Rr`] is the decoded counterpart; its
//! [`FromStr`] implementation is the decoder and its [`Display`]
//! implementation reproduces the same layout. [`text_form`] is the only
//! place the resolver builds the textual form, so the layout cannot
//! drift between the write and read paths.

use std::fmt;
use std::str::FromStr;

/// The record class used for every record Quarry serves.
pub const CLASS_IN: &str = "IN";

/// The type of CNAME records, used by the resolver's CNAME chase.
pub const TYPE_CNAME: &str = "CNAME";

////////////////////////////////////////////////////////////////////////
// RESOURCE RECORDS                                                   //
////////////////////////////////////////////////////////////////////////

/// A single decoded resource record.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Rr {
    pub name: String,
    pub ttl: u32,
    pub class: String,
    pub rr_type: String,
    pub data: String,
}

/// Builds the textual form of a resource record in the fixed
/// `<name> <ttl> <class> <type> <data>` layout with class
/// [`CLASS_IN`].
pub fn text_form(name: &str, ttl: u32, rr_type: &str, data: &str) -> String {
    format!("{} {} {} {} {}", name, ttl, CLASS_IN, rr_type, data)
}

impl FromStr for Rr {
    type Err = DecodeError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let (name, rest) = take_token(text).ok_or(DecodeError::MissingField("name"))?;
        let (ttl, rest) = take_token(rest).ok_or(DecodeError::MissingField("ttl"))?;
        let (class, rest) = take_token(rest).ok_or(DecodeError::MissingField("class"))?;
        let (rr_type, rest) = take_token(rest).ok_or(DecodeError::MissingField("type"))?;
        let data = rest.trim();
        if data.is_empty() {
            return Err(DecodeError::MissingField("data"));
        }
        let ttl = ttl.parse().or(Err(DecodeError::InvalidTtl))?;
        Ok(Self {
            name: name.to_owned(),
            ttl,
            class: class.to_owned(),
            rr_type: rr_type.to_owned(),
            data: data.to_owned(),
        })
    }
}

impl fmt::Display for Rr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.name, self.ttl, self.class, self.rr_type, self.data,
        )
    }
}

/// Splits the next whitespace-delimited token off the front of `text`,
/// returning the token and the remainder.
fn take_token(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    if text.is_empty() {
        return None;
    }
    let end = text
        .find(|c: char| c.is_ascii_whitespace())
        .unwrap_or(text.len());
    Some((&text[..end], &text[end..]))
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// Errors that arise when decoding the textual form of a resource
/// record.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DecodeError {
    MissingField(&'static str),
    InvalidTtl,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::MissingField(field) => write!(f, "the {} field is missing", field),
            Self::InvalidTtl => f.write_str("the TTL field is not a valid unsigned integer"),
        }
    }
}

impl std::error::Error for DecodeError {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoding_works() {
        let rr: Rr = "svc.example.com. 300 IN A 10.0.0.1".parse().unwrap();
        assert_eq!(rr.name, "svc.example.com.");
        assert_eq!(rr.ttl, 300);
        assert_eq!(rr.class, "IN");
        assert_eq!(rr.rr_type, "A");
        assert_eq!(rr.data, "10.0.0.1");
    }

    #[test]
    fn data_keeps_internal_whitespace() {
        let rr: Rr = "example.com. 60 IN MX 10 mail.example.com.".parse().unwrap();
        assert_eq!(rr.rr_type, "MX");
        assert_eq!(rr.data, "10 mail.example.com.");
    }

    #[test]
    fn decoding_tolerates_extra_whitespace() {
        let rr: Rr = "  example.com.   60  IN  A   10.0.0.1 ".parse().unwrap();
        assert_eq!(rr.name, "example.com.");
        assert_eq!(rr.data, "10.0.0.1");
    }

    #[test]
    fn display_reproduces_the_layout() {
        let text = text_form("example.com.", 60, "A", "10.0.0.1");
        let rr: Rr = text.parse().unwrap();
        assert_eq!(rr.to_string(), text);
    }

    #[test]
    fn truncated_records_are_rejected() {
        assert_eq!(
            "example.com. 60 IN A".parse::<Rr>(),
            Err(DecodeError::MissingField("data")),
        );
        assert_eq!(
            "example.com.".parse::<Rr>(),
            Err(DecodeError::MissingField("ttl")),
        );
        assert_eq!("".parse::<Rr>(), Err(DecodeError::MissingField("name")));
    }

    #[test]
    fn bad_ttls_are_rejected() {
        assert_eq!(
            "example.com. soon IN A 10.0.0.1".parse::<Rr>(),
            Err(DecodeError::InvalidTtl),
        );
    }
}
