//! Persona collaborator port.

use std::future::Future;
use std::pin::Pin;

use uuid::Uuid;

use companion_types::error::PersonaError;
use companion_types::persona::{Persona, PersonaChatConfig};

/// Read access to personas and their chat configuration.
pub trait PersonaProvider: Send + Sync {
    fn get_persona(
        &self,
        agent_id: &Uuid,
    ) -> impl Future<Output = Result<Persona, PersonaError>> + Send;

    /// `Ok(None)` when the persona has no chat configuration.
    fn get_chat_config(
        &self,
        agent_id: &Uuid,
    ) -> impl Future<Output = Result<Option<PersonaChatConfig>, PersonaError>> + Send;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait PersonaProviderDyn: Send + Sync {
    fn get_persona_boxed<'a>(
        &'a self,
        agent_id: &'a Uuid,
    ) -> BoxFuture<'a, Result<Persona, PersonaError>>;

    fn get_chat_config_boxed<'a>(
        &'a self,
        agent_id: &'a Uuid,
    ) -> BoxFuture<'a, Result<Option<PersonaChatConfig>, PersonaError>>;
}

impl<T: PersonaProvider> PersonaProviderDyn for T {
    fn get_persona_boxed<'a>(
        &'a self,
        agent_id: &'a Uuid,
    ) -> BoxFuture<'a, Result<Persona, PersonaError>> {
        Box::pin(self.get_persona(agent_id))
    }

    fn get_chat_config_boxed<'a>(
        &'a self,
        agent_id: &'a Uuid,
    ) -> BoxFuture<'a, Result<Option<PersonaChatConfig>, PersonaError>> {
        Box::pin(self.get_chat_config(agent_id))
    }
}

/// Type-erased persona provider.
pub struct BoxPersonaProvider {
    inner: Box<dyn PersonaProviderDyn + Send + Sync>,
}

impl BoxPersonaProvider {
    pub fn new<T: PersonaProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Box::new(provider),
        }
    }

    pub async fn get_persona(&self, agent_id: &Uuid) -> Result<Persona, PersonaError> {
        self.inner.get_persona_boxed(agent_id).await
    }

    pub async fn get_chat_config(
        &self,
        agent_id: &Uuid,
    ) -> Result<Option<PersonaChatConfig>, PersonaError> {
        self.inner.get_chat_config_boxed(agent_id).await
    }
}
