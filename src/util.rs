use std::any::Any;

/// Turn a caught panic payload into a failure message for the job record.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("job panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("job panicked: {message}")
    } else {
        "job panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_str_and_string_payloads() {
        assert_eq!(panic_message(Box::new("boom")), "job panicked: boom");
        assert_eq!(
            panic_message(Box::new("boom".to_string())),
            "job panicked: boom"
        );
        assert_eq!(panic_message(Box::new(42_u32)), "job panicked");
    }
}
