use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Local, Utc};
use hikeathon_core::{
    KeyValueStore,
    catalog::{DEFAULT_IMAGE_MODEL, DEFAULT_IMAGE_SIZE, ImageModel, available_sizes, image_model},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use super::Observable;
use crate::{
    api::{ApiClient, ApiRequest},
    error::{ApiError, StoreError},
};

pub const IMAGE_FUNCTION: &str = "proxy-images";
pub const IMAGE_HISTORY_KEY: &str = "image-history";
pub const MAX_HISTORY: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    pub id: String,
    pub prompt: String,
    pub model: String,
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageState {
    /// Newest first.
    pub history: Vec<GeneratedImage>,
    pub current_model: String,
    pub current_size: String,
    #[serde(skip)]
    pub is_generating: bool,
    #[serde(skip)]
    pub current_prompt: String,
    #[serde(skip)]
    pub error: Option<String>,
}

impl Default for ImageState {
    fn default() -> Self {
        Self {
            history: Vec::new(),
            current_model: DEFAULT_IMAGE_MODEL.to_owned(),
            current_size: DEFAULT_IMAGE_SIZE.to_owned(),
            is_generating: false,
            current_prompt: String::new(),
            error: None,
        }
    }
}

impl ImageState {
    pub fn current_model_info(&self) -> Option<&'static ImageModel> {
        image_model(&self.current_model)
    }

    pub fn available_sizes(&self) -> &'static [&'static str] {
        available_sizes(&self.current_model)
    }

    /// Images generated since local midnight.
    pub fn today(&self) -> Vec<&GeneratedImage> {
        let today = Local::now().date_naive();
        self.history
            .iter()
            .filter(|image| image.timestamp.with_timezone(&Local).date_naive() == today)
            .collect()
    }
}

/// Image generation through the `proxy-images` edge function. History is
/// kept in the durable tier.
pub struct ImageStore {
    api: ApiClient,
    storage: Arc<dyn KeyValueStore>,
    state: Observable<ImageState>,
}

impl ImageStore {
    pub fn new(api: ApiClient, storage: Arc<dyn KeyValueStore>) -> Self {
        let state = storage
            .get(IMAGE_HISTORY_KEY)
            .and_then(|raw| match serde_json::from_str::<ImageState>(&raw) {
                Ok(state) => Some(state),
                Err(err) => {
                    warn!("saved image history unreadable: {err}");
                    None
                }
            })
            .unwrap_or_default();
        Self {
            api,
            storage,
            state: Observable::new(state),
        }
    }

    pub fn state(&self) -> ImageState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<ImageState> {
        self.state.subscribe()
    }

    /// Generates one image. Blank prompts and calls made while another
    /// generation runs return `Ok(None)`.
    pub async fn generate_image(&self, prompt: &str) -> Result<Option<GeneratedImage>, StoreError> {
        if prompt.trim().is_empty() {
            return Ok(None);
        }
        let mut started = None;
        self.state.update(|s| {
            if s.is_generating {
                return;
            }
            s.is_generating = true;
            s.error = None;
            s.current_prompt = prompt.to_owned();
            started = Some((s.current_model.clone(), s.current_size.clone()));
        });
        let Some((model, size)) = started else {
            return Ok(None);
        };

        let result = self.request_image(prompt, &model, &size).await;
        self.state.update(|s| {
            s.is_generating = false;
            match &result {
                Ok(image) => {
                    s.history.insert(0, image.clone());
                    s.history.truncate(MAX_HISTORY);
                }
                Err(err) => s.error = Some(err.to_string()),
            }
        });
        match result {
            Ok(image) => {
                info!(model = %image.model, size = %image.size, "image generated");
                self.persist();
                Ok(Some(image))
            }
            Err(err) => {
                warn!(model = %model, "image generation failed: {err}");
                Err(err)
            }
        }
    }

    async fn request_image(
        &self,
        prompt: &str,
        model: &str,
        size: &str,
    ) -> Result<GeneratedImage, StoreError> {
        let request = ApiRequest::post(ApiClient::function_path(IMAGE_FUNCTION)).json(json!({
            "model": model,
            "prompt": prompt,
            "size": size,
            "n": 1,
            "quality": "standard",
            "response_format": "url",
        }));
        let data: Value = self.api.request(request).await?.error_for_status()?.json()?;

        let first = data.pointer("/data/0");
        let url = first
            .and_then(|item| item.get("url"))
            .or_else(|| data.get("url"))
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::Decode("no image URL in response".to_owned()))?;
        let revised_prompt = first
            .and_then(|item| item.get("revised_prompt"))
            .and_then(Value::as_str)
            .map(str::to_owned);

        Ok(GeneratedImage {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.to_owned(),
            model: model.to_owned(),
            url: url.to_owned(),
            timestamp: Utc::now(),
            size: size.to_owned(),
            revised_prompt,
        })
    }

    /// Selects a model, falling back to its first size when the current
    /// size is not offered. Unknown ids are refused.
    pub fn set_model(&self, model_id: &str) -> bool {
        let Some(model) = image_model(model_id) else {
            return false;
        };
        self.state.update(|s| {
            s.current_model = model.id.to_owned();
            if !model.sizes.contains(&s.current_size.as_str())
                && let Some(first) = model.sizes.first()
            {
                s.current_size = (*first).to_owned();
            }
        });
        self.persist();
        true
    }

    /// Sets the size if the current model offers it.
    pub fn set_size(&self, size: &str) -> bool {
        let mut accepted = false;
        self.state.update(|s| {
            if available_sizes(&s.current_model).contains(&size) {
                s.current_size = size.to_owned();
                accepted = true;
            }
        });
        if accepted {
            self.persist();
        }
        accepted
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut removed = false;
        self.state.update(|s| {
            let before = s.history.len();
            s.history.retain(|image| image.id != id);
            removed = s.history.len() != before;
        });
        if removed {
            self.persist();
        }
        removed
    }

    pub fn clear(&self) {
        self.state.update(|s| s.history.clear());
        self.persist();
    }

    /// Downloads `image` into `dir` as `hikeathon-image-<id prefix>.png`.
    pub async fn download(&self, image: &GeneratedImage, dir: &Path) -> Result<PathBuf, StoreError> {
        let response = self
            .api
            .request(ApiRequest::get(image.url.clone()).skip_auth())
            .await?
            .error_for_status()?;
        let prefix: String = image.id.chars().take(8).collect();
        let path = dir.join(format!("hikeathon-image-{prefix}.png"));
        std::fs::create_dir_all(dir).map_err(|err| {
            StoreError::Storage(format!("failed to create {}: {err}", dir.display()))
        })?;
        std::fs::write(&path, response.bytes()).map_err(|err| {
            StoreError::Storage(format!("failed to write {}: {err}", path.display()))
        })?;
        info!(path = %path.display(), "image saved");
        Ok(path)
    }

    fn persist(&self) {
        match self.state.read(serde_json::to_string) {
            Ok(json) => {
                if let Err(err) = self.storage.set(IMAGE_HISTORY_KEY, &json) {
                    warn!("failed to save image history: {err}");
                }
            }
            Err(err) => warn!("failed to encode image history: {err}"),
        }
    }
}
