use crate::error::{BuildError, Result};

/// A `USER` value split into its user and optional group halves. Names and
/// numeric ids both pass through untouched; resolution against the image's
/// passwd database happens at run time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSpec {
    pub user: String,
    pub group: Option<String>,
}

impl UserSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(BuildError::execution(
                "USER requires a user name or id".to_string(),
            ));
        }
        match spec.split_once(':') {
            None => Ok(Self {
                user: spec.to_string(),
                group: None,
            }),
            Some((user, group)) => {
                if user.is_empty() || group.is_empty() || group.contains(':') {
                    return Err(BuildError::execution(format!(
                        "invalid user specification: {spec}"
                    )));
                }
                Ok(Self {
                    user: user.to_string(),
                    group: Some(group.to_string()),
                })
            }
        }
    }

    pub fn numeric(&self) -> Option<(u32, Option<u32>)> {
        let uid = self.user.parse().ok()?;
        match &self.group {
            None => Some((uid, None)),
            Some(g) => Some((uid, Some(g.parse().ok()?))),
        }
    }
}
