use std::collections::HashMap;

use serde::Deserialize;

use crate::utils::url::construct_api_url;

#[derive(Deserialize, Clone, Debug)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub owned_by: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub created: Option<u64>,
}

#[derive(Deserialize, Debug)]
pub struct ModelsResponse {
    pub data: Vec<ModelInfo>,
}

/// Lookup table from bare model id to the provider that serves it, built
/// from the backend's model listing. Qualified `provider::model` strings
/// bypass the table entirely.
#[derive(Clone, Debug, Default)]
pub struct ModelRegistry {
    providers: HashMap<String, String>,
}

impl ModelRegistry {
    pub fn from_models(models: &[ModelInfo]) -> Self {
        let mut registry = Self::default();
        for model in models {
            if let Some(provider) = model.owned_by.as_deref() {
                registry.insert(&model.id, provider);
            }
        }
        registry
    }

    pub fn insert(&mut self, model: &str, provider: &str) {
        self.providers
            .insert(model.to_string(), provider.to_string());
    }

    pub fn provider_for(&self, model: &str) -> Option<&str> {
        self.providers.get(model).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Split a `provider::model` identifier into its halves. Returns `None` for
/// bare model ids, which must be resolved through the registry instead.
pub fn split_qualified(model: &str) -> Option<(&str, &str)> {
    let (provider, actual) = model.split_once("::")?;
    if provider.is_empty() || actual.is_empty() {
        return None;
    }
    Some((provider, actual))
}

pub async fn fetch_models(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
) -> Result<Vec<ModelInfo>, Box<dyn std::error::Error>> {
    let models_url = construct_api_url(base_url, "models");
    let mut request = client
        .get(models_url)
        .header("Content-Type", "application/json");
    if !api_key.is_empty() {
        request = request.bearer_auth(api_key);
    }

    let response = request.send().await?;

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(format!("Model listing failed with status {status}: {error_text}").into());
    }

    let models_response = response.json::<ModelsResponse>().await?;
    Ok(models_response.data)
}
