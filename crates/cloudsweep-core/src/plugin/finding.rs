use serde::{Deserialize, Serialize};

/// Outcome of one check against one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Warn,
    Fail,
    /// Any code outside 0..=2. Displayed, never folded into severity.
    Unknown,
}

impl Status {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Status::Ok,
            1 => Status::Warn,
            2 => Status::Fail,
            _ => Status::Unknown,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Status::Ok => 0,
            Status::Warn => 1,
            Status::Fail => 2,
            Status::Unknown => 3,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Warn => "WARN",
            Status::Fail => "FAIL",
            Status::Unknown => "UNKNOWN",
        }
    }

    pub fn severity(&self) -> Option<Severity> {
        match self {
            Status::Ok => Some(Severity::Ok),
            Status::Warn => Some(Severity::Warn),
            Status::Fail => Some(Severity::Fail),
            Status::Unknown => None,
        }
    }
}

/// Scan-wide worst status, `Ok < Warn < Fail`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    Ok,
    Warn,
    Fail,
}

impl Severity {
    pub fn code(&self) -> u8 {
        match self {
            Severity::Ok => 0,
            Severity::Warn => 1,
            Severity::Fail => 2,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Severity::Ok => "OK",
            Severity::Warn => "WARN",
            Severity::Fail => "FAIL",
        }
    }

    /// Fold a finding's status into the running maximum.
    pub fn fold(self, status: Status) -> Self {
        match status.severity() {
            Some(severity) => self.max(severity),
            None => self,
        }
    }
}

/// One result row emitted by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub status: Status,
    pub message: String,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

impl Finding {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            resource: None,
            region: None,
        }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(Status::Ok, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(Status::Warn, message)
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::new(Status::Fail, message)
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn resource_or_na(&self) -> &str {
        self.resource.as_deref().filter(|r| !r.is_empty()).unwrap_or("N/A")
    }

    pub fn region_or_global(&self) -> &str {
        self.region.as_deref().filter(|r| !r.is_empty()).unwrap_or("Global")
    }
}
