use std::sync::Arc;

use serde_json::{Map, Value};

/// Rendered span payload: display text plus an optional structured context
/// map that is serialized alongside the span.
#[derive(Clone, Debug)]
pub struct Message {
    text: String,
    context: Option<Map<String, Value>>,
}

impl Message {
    pub fn new(text: impl Into<String>) -> Self {
        Message {
            text: text.into(),
            context: None,
        }
    }

    pub fn with_context(text: impl Into<String>, context: Map<String, Value>) -> Self {
        Message {
            text: text.into(),
            context: Some(context),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    pub fn context(&self) -> Option<&Map<String, Value>> {
        self.context.as_ref()
    }

    /// Supplier for a fixed message text. Most span payloads are constant
    /// strings, so this avoids a closure allocation at every call site.
    pub fn supplier_of(text: impl Into<String>) -> Arc<dyn MessageSupplier> {
        Arc::new(ConstantMessage {
            text: text.into(),
            context: None,
        })
    }

    pub fn supplier_with_context(
        text: impl Into<String>,
        context: Map<String, Value>,
    ) -> Arc<dyn MessageSupplier> {
        Arc::new(ConstantMessage {
            text: text.into(),
            context: Some(context),
        })
    }
}

/// Deferred payload producer. Evaluated at snapshot time only, so the hot
/// path never pays formatting cost.
pub trait MessageSupplier: Send + Sync {
    fn message(&self) -> Message;
}

impl<F> MessageSupplier for F
where
    F: Fn() -> Message + Send + Sync,
{
    fn message(&self) -> Message {
        self()
    }
}

struct ConstantMessage {
    text: String,
    context: Option<Map<String, Value>>,
}

impl MessageSupplier for ConstantMessage {
    fn message(&self) -> Message {
        Message {
            text: self.text.clone(),
            context: self.context.clone(),
        }
    }
}

/// Payload of error spans and error span ends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorMessage {
    text: String,
}

impl ErrorMessage {
    pub fn new(text: impl Into<String>) -> Self {
        ErrorMessage { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

impl From<&str> for ErrorMessage {
    fn from(text: &str) -> Self {
        ErrorMessage::new(text)
    }
}

impl From<String> for ErrorMessage {
    fn from(text: String) -> Self {
        ErrorMessage { text }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_constant_supplier() {
        let supplier = Message::supplier_of("http request");
        assert_eq!(supplier.message().text(), "http request");
        assert!(supplier.message().context().is_none());
    }

    #[test]
    fn test_closure_supplier_is_deferred() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let supplier: Arc<dyn MessageSupplier> = Arc::new(|| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Message::new("deferred")
        });
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
        assert_eq!(supplier.message().text(), "deferred");
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_context_map_preserved() {
        let mut context = Map::new();
        context.insert("sql".to_string(), json!("select 1"));
        let supplier = Message::supplier_with_context("jdbc query", context);
        let message = supplier.message();
        assert_eq!(message.context().unwrap()["sql"], json!("select 1"));
    }
}
