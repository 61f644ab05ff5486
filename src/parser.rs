//! Repository CI config parser.
//!
//! The config file lives in the repository and describes the container
//! image, the environment fan-out, and the command list:
//!
//! ```yaml
//! image: ubuntu:22.04
//! env:
//!   - NODE_VERSION=18
//!   - NODE_VERSION=20
//! commands:
//!   - npm install
//!   - npm test
//! ```
//!
//! Each entry under `env` becomes one job. Parse failures carry the YAML
//! line and column so the trigger caller can surface them.

use serde::Deserialize;

use crate::error::{Result, ServerError};

#[derive(Debug, Deserialize)]
struct RawConfig {
    image: Option<String>,
    env: Option<Vec<String>>,
    commands: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedConfig {
    pub image: String,
    /// One entry per job; a config without an `env` key yields a single
    /// job with an empty environment.
    pub env: Vec<String>,
    pub commands: Vec<String>,
}

pub struct ConfigParser {
    raw: String,
}

impl ConfigParser {
    pub fn new(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
        }
    }

    pub fn parse(&self) -> Result<ParsedConfig> {
        let raw: RawConfig = serde_yaml::from_str(&self.raw).map_err(|e| {
            let location = e.location();
            ServerError::ConfigInvalid {
                line: location.as_ref().map_or(0, |l| l.line()),
                column: location.as_ref().map_or(0, |l| l.column()),
                message: e.to_string(),
            }
        })?;

        let image = raw.image.filter(|i| !i.is_empty()).ok_or_else(|| invalid("missing image"))?;

        let env = match raw.env {
            Some(env) if env.is_empty() => {
                // An empty fan-out would persist a build with zero jobs,
                // which can never complete.
                return Err(invalid("env list is empty"));
            }
            Some(env) => env,
            None => vec![String::new()],
        };

        let commands = raw
            .commands
            .filter(|c| !c.is_empty())
            .ok_or_else(|| invalid("missing commands"))?;

        Ok(ParsedConfig {
            image,
            env,
            commands,
        })
    }
}

fn invalid(message: &str) -> ServerError {
    ServerError::ConfigInvalid {
        line: 0,
        column: 0,
        message: message.to_string(),
    }
}
