//! Validated identifiers. Agents must parse user-supplied references through these types
//! before any upstream call.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static ORDER_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ORD-\d{4,10}$").expect("order id pattern"));
static TICKET_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^TKT-\d{3,10}$").expect("ticket id pattern"));
static ACCOUNT_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ACC-\d{3,10}$").expect("account id pattern"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("\"{value}\" is not a valid {kind} (expected {expected})")]
pub struct InvalidIdentifier {
    pub kind: &'static str,
    pub value: String,
    pub expected: &'static str,
}

/// Trim, drop a leading `#`, upper-case.
fn normalize(raw: &str) -> String {
    raw.trim().trim_start_matches('#').trim().to_ascii_uppercase()
}

macro_rules! identifier {
    ($name:ident, $re:ident, $kind:literal, $expected:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> Result<Self, InvalidIdentifier> {
                let value = normalize(raw);
                if $re.is_match(&value) {
                    Ok(Self(value))
                } else {
                    Err(InvalidIdentifier {
                        kind: $kind,
                        value: raw.trim().to_string(),
                        expected: $expected,
                    })
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

identifier!(OrderId, ORDER_ID, "order number", "ORD- followed by 4 to 10 digits");
identifier!(TicketId, TICKET_ID, "ticket number", "TKT- followed by 3 to 10 digits");
identifier!(AccountId, ACCOUNT_ID, "account id", "ACC- followed by 3 to 10 digits");
