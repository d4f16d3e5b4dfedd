//! Session, identity and locale types carried by a `RunContext`.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A logical user session. Supplied by the surrounding request layer.
pub trait Session: Send + Sync + fmt::Debug {
    /// Stable session identifier. Mutex keys and cancel lookups compare by it.
    fn id(&self) -> &str;

    /// Identity the session is authenticated as.
    fn subject(&self) -> Option<Subject> {
        None
    }

    /// Default locale for code running on behalf of this session.
    fn locale(&self) -> Option<Locale> {
        None
    }

    /// Session-scoped text bundle.
    fn texts(&self) -> Option<Arc<dyn TextBundle>> {
        None
    }
}

/// Localized text lookup.
pub trait TextBundle: Send + Sync + fmt::Debug {
    fn text(&self, key: &str) -> Option<String>;
}

/// Authenticated identity: an ordered list of principal names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    principals: Vec<String>,
}

impl Subject {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principals: vec![principal.into()],
        }
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principals.push(principal.into());
        self
    }

    /// The primary principal.
    pub fn name(&self) -> &str {
        self.principals.first().map(String::as_str).unwrap_or("")
    }

    pub fn principals(&self) -> &[String] {
        &self.principals
    }
}

/// BCP 47 language tag, e.g. `de-CH`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locale(String);

impl Locale {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn tag(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inbound request/response handles. Carried through the chain untouched;
/// only the request layer that created them knows their concrete types.
#[derive(Clone)]
pub struct RequestHandles {
    request: Arc<dyn Any + Send + Sync>,
    response: Arc<dyn Any + Send + Sync>,
}

impl RequestHandles {
    pub fn new<Req, Res>(request: Req, response: Res) -> Self
    where
        Req: Any + Send + Sync,
        Res: Any + Send + Sync,
    {
        Self {
            request: Arc::new(request),
            response: Arc::new(response),
        }
    }

    pub fn request<Req: Any>(&self) -> Option<&Req> {
        self.request.downcast_ref()
    }

    pub fn response<Res: Any>(&self) -> Option<&Res> {
        self.response.downcast_ref()
    }
}

impl fmt::Debug for RequestHandles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandles").finish_non_exhaustive()
    }
}

/// In-memory text bundle.
#[derive(Debug, Clone, Default)]
pub struct MapTextBundle {
    texts: HashMap<String, String>,
}

impl MapTextBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(mut self, key: impl Into<String>, text: impl Into<String>) -> Self {
        self.texts.insert(key.into(), text.into());
        self
    }
}

impl TextBundle for MapTextBundle {
    fn text(&self, key: &str) -> Option<String> {
        self.texts.get(key).cloned()
    }
}

/// Plain session implementation for embedders without their own session type.
#[derive(Debug, Clone)]
pub struct BasicSession {
    id: String,
    subject: Option<Subject>,
    locale: Option<Locale>,
    texts: Option<Arc<dyn TextBundle>>,
}

impl BasicSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subject: None,
            locale: None,
            texts: None,
        }
    }

    pub fn with_subject(mut self, subject: Subject) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn with_locale(mut self, locale: Locale) -> Self {
        self.locale = Some(locale);
        self
    }

    pub fn with_texts(mut self, texts: Arc<dyn TextBundle>) -> Self {
        self.texts = Some(texts);
        self
    }

    /// Wrap into the shared handle a `RunContext` carries.
    pub fn shared(self) -> Arc<dyn Session> {
        Arc::new(self)
    }
}

impl Session for BasicSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn subject(&self) -> Option<Subject> {
        self.subject.clone()
    }

    fn locale(&self) -> Option<Locale> {
        self.locale.clone()
    }

    fn texts(&self) -> Option<Arc<dyn TextBundle>> {
        self.texts.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_primary_principal() {
        let subject = Subject::new("anna").with_principal("admins");
        assert_eq!(subject.name(), "anna");
        assert_eq!(subject.principals().len(), 2);
    }

    #[test]
    fn request_handles_downcast() {
        let handles = RequestHandles::new("GET /orders".to_string(), 200u16);
        assert_eq!(handles.request::<String>().map(String::as_str), Some("GET /orders"));
        assert_eq!(handles.response::<u16>(), Some(&200));
        assert!(handles.request::<u16>().is_none());
    }

    #[test]
    fn basic_session_exposes_defaults() {
        let session = BasicSession::new("s-1")
            .with_locale(Locale::new("de-CH"))
            .with_texts(Arc::new(MapTextBundle::new().with_text("ok", "OK")));
        assert_eq!(session.id(), "s-1");
        assert_eq!(session.locale().unwrap().tag(), "de-CH");
        assert_eq!(session.texts().unwrap().text("ok").as_deref(), Some("OK"));
        assert!(session.subject().is_none());
    }

    #[test]
    fn locale_serializes_as_tag() {
        let json = serde_json::to_string(&Locale::new("fr-CA")).unwrap();
        assert_eq!(json, "\"fr-CA\"");
    }
}
