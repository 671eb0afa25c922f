/*
 * SPDX-FileCopyrightText: Copyright (c) 2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use snafu::prelude::*;

// Shell metacharacters that must never reach a subprocess argv. Identifiers
// are rejected up front, before any external tool is spawned.
const FORBIDDEN_CHARS: &[char] = &[
    '&', '|', ';', ':', '$', '*', '?', '<', '>', '!', ' ', '\\', '.', ']', '[', '+', '\'', '`',
    '~', '}', '{', '"', ')', '(',
];

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub))]
pub enum Error {
    #[snafu(display("Invalid character in {what} `{value}`"))]
    ForbiddenCharacter { what: &'static str, value: String },
    #[snafu(display("Empty {what}"))]
    EmptyIdentifier { what: &'static str },
}

pub fn validate_identifier(what: &'static str, value: &str) -> Result<(), Error> {
    validate(what, value, false)
}

// Domains are the one identifier that legitimately contains dots.
pub fn validate_domain(value: &str) -> Result<(), Error> {
    validate("domain", value, true)
}

fn validate(what: &'static str, value: &str, allow_dots: bool) -> Result<(), Error> {
    ensure!(!value.trim().is_empty(), EmptyIdentifier { what });
    let forbidden = value
        .chars()
        .any(|c| FORBIDDEN_CHARS.contains(&c) && !(allow_dots && c == '.'));
    ensure!(
        !forbidden,
        ForbiddenCharacter {
            what,
            value: value.to_owned(),
        }
    );
    Ok(())
}

// Captured tool output is scanned segment-wise; `#` is the segment marker the
// klist/ldapsearch parsers expect, newlines are equivalent.
pub fn segments(output: &str) -> impl Iterator<Item = &str> {
    output.split(['#', '\n']).map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_set_is_closed() {
        for c in FORBIDDEN_CHARS {
            let value = format!("webapp{c}01");
            assert!(
                validate_identifier("account", &value).is_err(),
                "`{c}` must be rejected"
            );
        }
    }

    #[test]
    fn injection_is_rejected_in_domains() {
        assert!(validate_domain("contoso.com; rm -rf /").is_err());
        assert!(validate_domain("contoso.com").is_ok());
    }

    #[test]
    fn plain_identifiers_pass() {
        assert!(validate_identifier("lease", "lease-001").is_ok());
        assert!(validate_identifier("account", "webapp01").is_ok());
        assert!(validate_identifier("lease", "").is_err());
        assert!(validate_identifier("account", "web.app").is_err());
    }

    #[test]
    fn segments_split_on_hash_and_newline() {
        let out = "first#second\nthird";
        let segs: Vec<_> = segments(out).collect();
        assert_eq!(segs, vec!["first", "second", "third"]);
    }
}
