//! Billing error types

use thiserror::Error;

/// A billing provider failure, safe to show to the end user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentError {
    /// Message that can be displayed as-is
    pub user_message: String,
    /// Provider error code, when the provider supplied one
    pub code: Option<String>,
}

impl PaymentError {
    pub fn new(user_message: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for PaymentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.user_message)
    }
}

#[derive(Debug, Error)]
pub enum BillingError {
    /// Plan or seat constraints violated; nothing was changed
    #[error("Validation error: {0}")]
    Validation(String),

    /// The billing provider rejected the request or could not be reached
    #[error("Payment error: {0}")]
    Payment(PaymentError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn payment(user_message: impl Into<String>) -> Self {
        Self::Payment(PaymentError::new(user_message))
    }

    /// Message suitable for end users; internal details are not exposed
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) | Self::NotFound(msg) => msg.clone(),
            Self::Payment(err) => err.user_message.clone(),
            Self::Database(_) | Self::Config(_) | Self::Internal(_) => {
                "Something went wrong, please try again later".to_string()
            }
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Payment(_) | Self::NotFound(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("Record not found".to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match err {
            stripe::StripeError::Stripe(request_error) => {
                let message = request_error
                    .message
                    .clone()
                    .unwrap_or_else(|| "Your payment could not be processed".to_string());
                let mut payment = PaymentError::new(message);
                if let Some(code) = request_error.code {
                    payment = payment.with_code(format!("{:?}", code));
                }
                Self::Payment(payment)
            }
            stripe::StripeError::Timeout => {
                Self::payment("The payment provider did not respond in time, please try again")
            }
            other => {
                tracing::warn!(error = %other, "Unexpected billing provider error");
                Self::payment("The payment provider could not be reached, please try again")
            }
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
