use cloudlet_common::HandoffError;

/// Recovers the `HandoffError` class an adapter attached to an `anyhow` error,
/// falling back to `fallback` for unclassified failures.
pub trait ClassifyError<T> {
    fn classify(self, fallback: fn(String) -> HandoffError) -> Result<T, HandoffError>;
}

impl<T> ClassifyError<T> for anyhow::Result<T> {
    fn classify(self, fallback: fn(String) -> HandoffError) -> Result<T, HandoffError> {
        self.map_err(|err| match err.downcast_ref::<HandoffError>() {
            Some(known) => known.clone(),
            None => fallback(format!("{:#}", err)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_errors_survive_anyhow() {
        let res: anyhow::Result<()> = Err(HandoffError::Authentication("bad token".into()).into());
        assert_eq!(
            res.classify(HandoffError::Transfer).unwrap_err(),
            HandoffError::Authentication("bad token".into())
        );

        let res: anyhow::Result<()> = Err(anyhow::anyhow!("connection reset"));
        assert_eq!(
            res.classify(HandoffError::Transfer).unwrap_err(),
            HandoffError::Transfer("connection reset".into())
        );
    }
}
