use uuid::Uuid;

/// Unit-of-work context handed to the event bus by the caller.
///
/// Carries the acting user (stamped into snapshot auditing fields) and a correlation id for
/// logs. Nothing is read from task or thread locals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    pub user_id: Option<String>,
    pub correlation_id: Uuid,
}

impl Context {
    pub fn new() -> Self {
        Self {
            user_id: None,
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn system() -> Self {
        Self::new().user("system")
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());

        self
    }

    pub fn correlation_id(mut self, value: Uuid) -> Self {
        self.correlation_id = value;

        self
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
