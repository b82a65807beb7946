use std::error::Error;
use std::fmt::{Display, Formatter};

pub type DoseResult<T> = Result<T, DoseError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DoseErrorCategory {
    Success,
    Validation,
    IoSystem,
    Calculation,
    Internal,
    BackendUnavailable,
}

impl DoseErrorCategory {
    pub const fn exit_status(self) -> ExitStatus {
        match self {
            Self::Success => ExitStatus {
                exit_code: 0,
                name: "Success",
            },
            Self::Validation => ExitStatus {
                exit_code: 2,
                name: "ValidationError",
            },
            Self::IoSystem => ExitStatus {
                exit_code: 3,
                name: "IoSystemError",
            },
            Self::Calculation => ExitStatus {
                exit_code: 4,
                name: "CalculationError",
            },
            Self::Internal => ExitStatus {
                exit_code: 5,
                name: "InternalError",
            },
            Self::BackendUnavailable => ExitStatus {
                exit_code: 6,
                name: "BackendUnavailableError",
            },
        }
    }

    pub const fn exit_code(self) -> i32 {
        self.exit_status().exit_code
    }

    pub const fn name(self) -> &'static str {
        self.exit_status().name
    }

    pub const fn is_fatal(self) -> bool {
        !matches!(self, Self::Success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub exit_code: i32,
    pub name: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoseError {
    category: DoseErrorCategory,
    placeholder: &'static str,
    message: String,
}

impl DoseError {
    pub fn new(
        category: DoseErrorCategory,
        placeholder: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            placeholder,
            message: message.into(),
        }
    }

    pub fn validation(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(DoseErrorCategory::Validation, placeholder, message)
    }

    pub fn backend_unavailable(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(DoseErrorCategory::BackendUnavailable, placeholder, message)
    }

    pub fn calculation(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(DoseErrorCategory::Calculation, placeholder, message)
    }

    pub fn io_system(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(DoseErrorCategory::IoSystem, placeholder, message)
    }

    pub fn internal(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(DoseErrorCategory::Internal, placeholder, message)
    }

    pub const fn category(&self) -> DoseErrorCategory {
        self.category
    }

    pub const fn placeholder(&self) -> &'static str {
        self.placeholder
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn exit_code(&self) -> i32 {
        self.category.exit_code()
    }

    pub const fn is_validation(&self) -> bool {
        matches!(self.category, DoseErrorCategory::Validation)
    }

    pub fn diagnostic_line(&self) -> String {
        let severity = if self.category.is_fatal() {
            "ERROR"
        } else {
            "INFO"
        };
        format!("{}: [{}] {}", severity, self.placeholder, self.message)
    }

    pub fn fatal_exit_line(&self) -> Option<String> {
        self.category
            .is_fatal()
            .then(|| format!("FATAL EXIT CODE: {}", self.exit_code()))
    }
}

impl Display for DoseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.category.name(),
            self.placeholder,
            self.message
        )
    }
}

impl Error for DoseError {}
