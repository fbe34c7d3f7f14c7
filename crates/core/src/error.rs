#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid thing name '{0}': must be non-empty and contain no '/', '+' or '#'")]
    InvalidThingName(String),

    #[error("Invalid job id '{0}': must be non-empty and contain no '/', '+' or '#'")]
    InvalidJobId(String),

    #[error("Malformed execution: {0}")]
    MalformedExecution(String),
}
