use serde::Serialize;

pub const DEFAULT_CHAT_MODEL: &str = "gpt-oss-120b";
pub const DEFAULT_IMAGE_MODEL: &str = "flux-1-schnell";
pub const DEFAULT_IMAGE_SIZE: &str = "1024x1024";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatModel {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub context_length: u32,
    pub provider: &'static str,
}

pub static CHAT_MODELS: [ChatModel; 8] = [
    ChatModel {
        id: "gpt-oss-120b",
        name: "GPT OSS 120B",
        description: "Most capable open-source model",
        context_length: 32_768,
        provider: "IONOS",
    },
    ChatModel {
        id: "llama-3.3-70b",
        name: "Llama 3.3 70B",
        description: "Latest Llama model",
        context_length: 16_384,
        provider: "Meta",
    },
    ChatModel {
        id: "llama-3.1-70b",
        name: "Llama 3.1 70B",
        description: "Previous Llama generation",
        context_length: 8_192,
        provider: "Meta",
    },
    ChatModel {
        id: "qwen-2.5-72b",
        name: "Qwen 2.5 72B",
        description: "Alibaba multilingual model",
        context_length: 32_768,
        provider: "Alibaba",
    },
    ChatModel {
        id: "mistral-nemo-12b",
        name: "Mistral Nemo 12B",
        description: "Fast and efficient",
        context_length: 8_192,
        provider: "Mistral",
    },
    ChatModel {
        id: "codestral-22b",
        name: "Codestral 22B",
        description: "Optimized for coding",
        context_length: 16_384,
        provider: "Mistral",
    },
    ChatModel {
        id: "gemma-2-27b",
        name: "Gemma 2 27B",
        description: "Google's efficient model",
        context_length: 8_192,
        provider: "Google",
    },
    ChatModel {
        id: "phi-3.5-mini",
        name: "Phi 3.5 Mini",
        description: "Smallest, fastest model",
        context_length: 4_096,
        provider: "Microsoft",
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageModel {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub max_prompt_length: usize,
    pub sizes: &'static [&'static str],
    pub provider: &'static str,
}

const SQUARE_SIZES: &[&str] = &["512x512", "768x768", "1024x1024"];
const DEFAULT_SIZES: &[&str] = &[DEFAULT_IMAGE_SIZE];
const WIDE_SIZES: &[&str] = &["512x512", "768x768", "1024x1024", "1024x576", "576x1024"];

pub static IMAGE_MODELS: [ImageModel; 5] = [
    ImageModel {
        id: "flux-1-schnell",
        name: "FLUX.1 Schnell",
        description: "Fastest image generation, good quality",
        max_prompt_length: 1_000,
        sizes: SQUARE_SIZES,
        provider: "Black Forest Labs",
    },
    ImageModel {
        id: "flux-1-dev",
        name: "FLUX.1 Dev",
        description: "Balanced speed and quality",
        max_prompt_length: 1_000,
        sizes: WIDE_SIZES,
        provider: "Black Forest Labs",
    },
    ImageModel {
        id: "stable-diffusion-xl",
        name: "Stable Diffusion XL",
        description: "High quality, versatile",
        max_prompt_length: 1_000,
        sizes: WIDE_SIZES,
        provider: "Stability AI",
    },
    ImageModel {
        id: "stable-diffusion-3",
        name: "Stable Diffusion 3",
        description: "Latest SD version, excellent quality",
        max_prompt_length: 1_000,
        sizes: WIDE_SIZES,
        provider: "Stability AI",
    },
    ImageModel {
        id: "dall-e-3",
        name: "DALL-E 3",
        description: "Advanced creativity and understanding",
        max_prompt_length: 4_000,
        sizes: &["1024x1024", "1024x1792", "1792x1024"],
        provider: "OpenAI",
    },
];

pub fn chat_model(id: &str) -> Option<&'static ChatModel> {
    CHAT_MODELS.iter().find(|model| model.id == id)
}

pub fn image_model(id: &str) -> Option<&'static ImageModel> {
    IMAGE_MODELS.iter().find(|model| model.id == id)
}

/// Sizes offered for a model; unknown models fall back to the default square.
pub fn available_sizes(model_id: &str) -> &'static [&'static str] {
    image_model(model_id).map_or(DEFAULT_SIZES, |model| model.sizes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_exist_in_catalogues() {
        assert!(chat_model(DEFAULT_CHAT_MODEL).is_some());
        let image = image_model(DEFAULT_IMAGE_MODEL).unwrap();
        assert!(image.sizes.contains(&DEFAULT_IMAGE_SIZE));
    }

    #[test]
    fn unknown_model_gets_default_size() {
        assert_eq!(available_sizes("nope"), &["1024x1024"]);
        assert_eq!(available_sizes("dall-e-3")[1], "1024x1792");
    }
}
