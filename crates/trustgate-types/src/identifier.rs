//! Party, service and security-server identifiers.
//!
//! Identifiers are immutable value types with structural equality and are
//! used as map keys throughout the workspace. Their textual form is
//! `INSTANCE/CLASS/CODE[/SUBSYSTEM]`; the same form is accepted by
//! [`PartyId::from_str`](std::str::FromStr), which is how REST callers name
//! themselves in request headers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Errors produced when an identifier is malformed or carries characters
/// that cannot travel on the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    /// A mandatory identifier field is empty.
    #[error("identifier field '{field}' must not be empty")]
    Empty {
        /// Name of the empty field.
        field: &'static str,
    },

    /// A field contains a forbidden character.
    #[error("identifier field '{field}' contains illegal character U+{code:04X}")]
    ForbiddenCharacter {
        /// Name of the offending field.
        field: &'static str,
        /// Code point of the first forbidden character.
        code: u32,
    },

    /// The textual form could not be split into identifier parts.
    #[error("malformed identifier '{0}'")]
    Malformed(String),
}

/// Returns `true` for characters that must never appear in an identifier:
/// ISO control characters, the path and separator characters `% : ; / \`,
/// the zero-width space and the byte-order mark.
pub fn is_forbidden_char(c: char) -> bool {
    c <= '\u{1f}'
        || ('\u{7f}'..='\u{9f}').contains(&c)
        || matches!(c, '%' | ':' | ';' | '/' | '\\' | '\u{200b}' | '\u{feff}')
}

/// Validates a single identifier field.
///
/// # Errors
///
/// Returns [`IdentifierError`] if the value is empty or contains a character
/// rejected by [`is_forbidden_char`].
pub fn validate_field(field: &'static str, value: &str) -> Result<(), IdentifierError> {
    if value.is_empty() {
        return Err(IdentifierError::Empty { field });
    }
    match value.chars().find(|c| is_forbidden_char(*c)) {
        Some(c) => Err(IdentifierError::ForbiddenCharacter {
            field,
            code: c as u32,
        }),
        None => Ok(()),
    }
}

/// Identifies a federation member or one of its subsystems.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartyId {
    /// Federation instance, e.g. `EE`.
    pub instance: String,
    /// Member class, e.g. `GOV`.
    pub member_class: String,
    /// Member code, unique within the class.
    pub member_code: String,
    /// Optional subsystem of the member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsystem_code: Option<String>,
}

impl PartyId {
    /// Creates a member-level identifier.
    pub fn member(
        instance: impl Into<String>,
        member_class: impl Into<String>,
        member_code: impl Into<String>,
    ) -> Self {
        Self {
            instance: instance.into(),
            member_class: member_class.into(),
            member_code: member_code.into(),
            subsystem_code: None,
        }
    }

    /// Creates a subsystem-level identifier.
    pub fn subsystem(
        instance: impl Into<String>,
        member_class: impl Into<String>,
        member_code: impl Into<String>,
        subsystem_code: impl Into<String>,
    ) -> Self {
        Self {
            subsystem_code: Some(subsystem_code.into()),
            ..Self::member(instance, member_class, member_code)
        }
    }

    /// Returns the owning member of this party (drops the subsystem).
    pub fn member_id(&self) -> PartyId {
        Self::member(&self.instance, &self.member_class, &self.member_code)
    }

    /// Checks every field for wire-illegal characters.
    ///
    /// # Errors
    ///
    /// Returns the first [`IdentifierError`] found.
    pub fn validate(&self) -> Result<(), IdentifierError> {
        validate_field("instance", &self.instance)?;
        validate_field("memberClass", &self.member_class)?;
        validate_field("memberCode", &self.member_code)?;
        if let Some(subsystem) = &self.subsystem_code {
            validate_field("subsystemCode", subsystem)?;
        }
        Ok(())
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.instance, self.member_class, self.member_code
        )?;
        if let Some(subsystem) = &self.subsystem_code {
            write!(f, "/{subsystem}")?;
        }
        Ok(())
    }
}

impl FromStr for PartyId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let id = match parts.as_slice() {
            [instance, class, code] => Self::member(*instance, *class, *code),
            [instance, class, code, subsystem] => {
                Self::subsystem(*instance, *class, *code, *subsystem)
            }
            _ => return Err(IdentifierError::Malformed(s.to_string())),
        };
        id.validate()?;
        Ok(id)
    }
}

/// Identifies a service offered by a provider party.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceId {
    /// The party that provides the service.
    #[serde(flatten)]
    pub provider: PartyId,
    /// Service code.
    pub service_code: String,
    /// Optional service version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_version: Option<String>,
}

impl ServiceId {
    /// Creates a service identifier without a version.
    pub fn new(provider: PartyId, service_code: impl Into<String>) -> Self {
        Self {
            provider,
            service_code: service_code.into(),
            service_version: None,
        }
    }

    /// Returns a copy of this identifier with the given version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = Some(version.into());
        self
    }

    /// Checks the provider and service fields for wire-illegal characters.
    ///
    /// # Errors
    ///
    /// Returns the first [`IdentifierError`] found.
    pub fn validate(&self) -> Result<(), IdentifierError> {
        self.provider.validate()?;
        validate_field("serviceCode", &self.service_code)?;
        if let Some(version) = &self.service_version {
            validate_field("serviceVersion", version)?;
        }
        Ok(())
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.service_code)?;
        if let Some(version) = &self.service_version {
            write!(f, "/{version}")?;
        }
        Ok(())
    }
}

/// Identifies one security server (a network endpoint) of a member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityServerId {
    /// Owning member (member level, no subsystem).
    #[serde(flatten)]
    pub owner: PartyId,
    /// Server code, unique per owner.
    pub server_code: String,
}

impl SecurityServerId {
    /// Creates a security-server identifier.
    pub fn new(owner: PartyId, server_code: impl Into<String>) -> Self {
        Self {
            owner: owner.member_id(),
            server_code: server_code.into(),
        }
    }

    /// Checks the owner and server code for wire-illegal characters.
    ///
    /// # Errors
    ///
    /// Returns the first [`IdentifierError`] found.
    pub fn validate(&self) -> Result<(), IdentifierError> {
        self.owner.validate()?;
        validate_field("serverCode", &self.server_code)
    }
}

impl fmt::Display for SecurityServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.server_code)
    }
}

impl FromStr for SecurityServerId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        match parts.as_slice() {
            [instance, class, code, server] => {
                let id = Self::new(PartyId::member(*instance, *class, *code), *server);
                id.validate()?;
                Ok(id)
            }
            _ => Err(IdentifierError::Malformed(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn party_id_display_and_parse_agree() {
        let id = PartyId::subsystem("EE", "GOV", "70000001", "registry");
        assert_eq!(id.to_string(), "EE/GOV/70000001/registry");
        assert_eq!("EE/GOV/70000001/registry".parse::<PartyId>().unwrap(), id);

        let member: PartyId = "EE/COM/123".parse().unwrap();
        assert_eq!(member.subsystem_code, None);
    }

    #[test]
    fn party_id_rejects_wrong_arity() {
        assert!(matches!(
            "EE/GOV".parse::<PartyId>(),
            Err(IdentifierError::Malformed(_))
        ));
        assert!("EE/GOV/1/2/3".parse::<PartyId>().is_err());
    }

    #[test]
    fn forbidden_characters_are_rejected() {
        for bad in ["a:b", "a;b", "a%b", "a\\b", "a\u{200b}b", "\u{feff}a", "a\u{7f}", "a\u{85}", "a\tb"] {
            let id = PartyId::member("EE", "GOV", bad);
            assert!(
                matches!(id.validate(), Err(IdentifierError::ForbiddenCharacter { .. })),
                "expected rejection of {bad:?}"
            );
        }
    }

    #[test]
    fn ordinary_characters_are_accepted() {
        let id = PartyId::subsystem("EE", "GOV", "70000001-a.b_c", "sub system ä");
        assert!(id.validate().is_ok());
    }

    #[test]
    fn empty_fields_are_rejected() {
        let service = ServiceId::new(PartyId::member("EE", "GOV", "1"), "");
        assert_eq!(
            service.validate(),
            Err(IdentifierError::Empty {
                field: "serviceCode"
            })
        );
    }

    #[test]
    fn identifiers_are_usable_as_map_keys() {
        let mut map = std::collections::HashMap::new();
        map.insert(PartyId::member("EE", "GOV", "1"), 1);
        assert_eq!(map.get(&PartyId::member("EE", "GOV", "1")), Some(&1));
        assert_eq!(map.get(&PartyId::subsystem("EE", "GOV", "1", "x")), None);
    }

    #[test]
    fn service_id_serializes_flat() {
        let service = ServiceId::new(PartyId::member("EE", "GOV", "1"), "getPerson")
            .with_version("v1");
        let json = serde_json::to_value(&service).unwrap();
        assert_eq!(json["instance"], "EE");
        assert_eq!(json["serviceCode"], "getPerson");
        assert_eq!(json["serviceVersion"], "v1");
        let back: ServiceId = serde_json::from_value(json).unwrap();
        assert_eq!(back, service);
    }

    #[test]
    fn security_server_owner_is_member_level() {
        let server = SecurityServerId::new(PartyId::subsystem("EE", "GOV", "1", "x"), "ss1");
        assert_eq!(server.owner.subsystem_code, None);
        assert_eq!(server.to_string(), "EE/GOV/1/ss1");
        assert_eq!("EE/GOV/1/ss1".parse::<SecurityServerId>().unwrap(), server);
    }
}
