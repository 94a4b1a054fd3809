use std::env;
use std::fmt::Debug;

/// Engine error carried across every API boundary.
///
/// Codes 1..=99 are internal faults (store, environment); codes from 100
/// upwards are caller faults: invalid state, validation, not found,
/// conflict, excessive detour.
#[derive(Debug)]
pub struct Error {
    pub code: i32,
    pub message: String,
}

impl Error {
    pub fn is_internal(&self) -> bool {
        (1..=99).contains(&self.code)
    }

    pub fn is_invalid_state(&self) -> bool {
        self.code == 100
    }

    pub fn is_validation(&self) -> bool {
        self.code == 101 || self.code == 104
    }

    pub fn is_not_found(&self) -> bool {
        self.code == 102
    }

    pub fn is_conflict(&self) -> bool {
        self.code == 103
    }

    pub fn is_excessive_detour(&self) -> bool {
        self.code == 104
    }
}

impl From<env::VarError> for Error {
    fn from(err: env::VarError) -> Self {
        env_var_error(err)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        database_error(err)
    }
}

pub fn env_var_error(_: env::VarError) -> Error {
    Error {
        code: 1,
        message: "environment variable error".into(),
    }
}

pub fn database_error<T: Debug>(err: T) -> Error {
    tracing::error!(?err, "store error");

    Error {
        code: 2,
        message: "store error".into(),
    }
}

pub fn unexpected_error() -> Error {
    Error {
        code: 5,
        message: "unexpected error".into(),
    }
}

pub fn invalid_state_error() -> Error {
    Error {
        code: 100,
        message: "invalid state".into(),
    }
}

pub fn validation_error(message: impl Into<String>) -> Error {
    Error {
        code: 101,
        message: message.into(),
    }
}

pub fn not_found_error(what: &str) -> Error {
    Error {
        code: 102,
        message: format!("{} not found", what),
    }
}

pub fn conflict_error(message: impl Into<String>) -> Error {
    Error {
        code: 103,
        message: message.into(),
    }
}

pub fn excessive_detour_error(detour_percentage: f64, limit: f64) -> Error {
    Error {
        code: 104,
        message: format!(
            "detour of {:.2}% exceeds the allowed {:.2}%",
            detour_percentage, limit
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_predicates() {
        assert!(not_found_error("ride").is_not_found());
        assert!(conflict_error("no seats").is_conflict());
        assert!(validation_error("bad input").is_validation());
        assert!(excessive_detour_error(40.0, 20.0).is_validation());
        assert!(excessive_detour_error(40.0, 20.0).is_excessive_detour());
        assert!(invalid_state_error().is_invalid_state());
        assert!(unexpected_error().is_internal());
        assert!(!validation_error("bad input").is_internal());
    }
}
