use crate::error::{Error, Result};
use regex::Regex;
use std::fmt;

/// Name of a container image such as `ghcr.io/acme/app:1.2`.
///
/// The repository part must satisfy the following regular expression from the
/// [OCI distribution spec 1.1.0](https://github.com/opencontainers/distribution-spec/blob/v1.1.0/spec.md):
///
/// ```regex
/// [a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*(\/[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*)*
/// ```
///
/// and the tag part must be at most 128 characters matching
/// `[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageName {
    pub domain: String,
    pub port: Option<u16>,
    pub name: String,
    pub reference: String,
}

lazy_static::lazy_static! {
    static ref NAME_RE: Regex = Regex::new(
        r"^[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*(/[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*)*$"
    ).unwrap();
    static ref REF_RE: Regex = Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").unwrap();
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(
                f,
                "{}:{}/{}:{}",
                self.domain, port, self.name, self.reference
            ),
            None => write!(f, "{}/{}:{}", self.domain, self.name, self.reference),
        }
    }
}

impl Default for ImageName {
    fn default() -> Self {
        let name = uuid::Uuid::new_v4().hyphenated().to_string();
        Self::parse(&name).expect("UUID v4 hyphenated name is always valid")
    }
}

impl ImageName {
    pub fn parse(name: &str) -> Result<Self> {
        let (domain, name) = match name.split_once('/') {
            // A leading component with a dot or a port is a registry domain,
            // everything else belongs to the repository name.
            Some((head, tail)) if head.contains('.') || head.contains(':') || head == "localhost" =>
            {
                (head, tail.to_string())
            }
            _ => ("docker.io", name.to_string()),
        };
        let (domain, port) = if let Some((domain, port)) = domain.split_once(':') {
            (domain, Some(str::parse(port)?))
        } else {
            (domain, None)
        };
        let (name, reference) = name
            .split_once(':')
            .map(|(n, r)| (n.to_string(), r.to_string()))
            .unwrap_or((name, "latest".to_string()));
        if !NAME_RE.is_match(&name) {
            return Err(Error::InvalidName(name));
        }
        if !REF_RE.is_match(&reference) {
            return Err(Error::InvalidReference(reference));
        }
        Ok(ImageName {
            domain: domain.to_string(),
            port,
            name,
            reference,
        })
    }

    /// The `name:reference` part without the registry domain, as passed to a
    /// container runtime.
    pub fn short(&self) -> String {
        format!("{}:{}", self.name, self.reference)
    }
}
