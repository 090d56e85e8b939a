//! Per-connection decrypt decision
//!
//! `--decrypt` is a template rendered once per connection. The rendered
//! text, trimmed, must read as a boolean:
//! `1 t T TRUE true True` or `0 f F FALSE false False`.
//!
//! Template variables: `servername`, `local_addr`, `remote_addr`, `addr`,
//! `port`. The `rand(n)` function returns an integer in `[0, n]`.

use super::error::DecisionError;
use minijinja::{Environment, ErrorKind};
use rand::Rng;
use serde::{Serialize, Serializer};
use std::net::SocketAddr;

const TEMPLATE_NAME: &str = "decrypt";

/// What is known about a connection when the decision is made
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionFacts {
    /// SNI from the ClientHello, empty when absent
    pub servername: String,
    #[serde(serialize_with = "as_display")]
    pub local_addr: SocketAddr,
    #[serde(serialize_with = "as_display")]
    pub remote_addr: SocketAddr,
    /// Listen address as configured
    pub addr: String,
    /// Listening port
    pub port: u16,
}

/// Compiled `--decrypt` template
pub struct DecisionTemplate {
    env: Option<Environment<'static>>,
}

impl DecisionTemplate {
    /// Compile `source`; an empty source always decides `false`
    pub fn parse(source: &str) -> Result<Self, minijinja::Error> {
        if source.trim().is_empty() {
            return Ok(Self { env: None });
        }

        let mut env = Environment::new();
        env.add_function("rand", |n: i64| -> Result<i64, minijinja::Error> {
            if n < 0 {
                return Err(minijinja::Error::new(
                    ErrorKind::InvalidOperation,
                    "rand() needs a non-negative bound",
                ));
            }
            Ok(rand::thread_rng().gen_range(0..=n))
        });
        env.add_template_owned(TEMPLATE_NAME, source.to_string())?;
        Ok(Self { env: Some(env) })
    }

    /// True when some connection may be decrypted
    pub fn may_decrypt(&self) -> bool {
        self.env.is_some()
    }

    /// Render the template for one connection
    pub fn evaluate(&self, facts: &ConnectionFacts) -> Result<bool, DecisionError> {
        let Some(env) = &self.env else {
            return Ok(false);
        };
        let rendered = env.get_template(TEMPLATE_NAME)?.render(facts)?;
        parse_bool(rendered.trim()).ok_or(DecisionError::NotBoolean(rendered))
    }
}

fn as_display<S: Serializer>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(addr)
}

/// Boolean spellings accepted from rendered templates
pub fn parse_bool(text: &str) -> Option<bool> {
    match text {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}
