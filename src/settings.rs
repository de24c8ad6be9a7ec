use std::path::PathBuf;

use ash::vk;
use log::{info, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderSettings {
    #[serde(default = "RenderSettings::default_sample_count")]
    pub sample_count: u32,
    #[serde(default = "RenderSettings::default_shadow_map_size")]
    pub shadow_map_size: u32,
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default)]
    pub present_mode: PresentModeSetting,
    #[serde(default = "RenderSettings::default_cache_dir")]
    pub texture_cache_dir: PathBuf,
    #[serde(default = "RenderSettings::default_scenes")]
    pub scenes: Vec<PathBuf>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            sample_count: Self::default_sample_count(),
            shadow_map_size: Self::default_shadow_map_size(),
            resolution: Resolution::default(),
            present_mode: PresentModeSetting::default(),
            texture_cache_dir: Self::default_cache_dir(),
            scenes: Self::default_scenes(),
        }
    }
}

impl RenderSettings {
    pub fn load() -> Self {
        Self::load_from_path("settings.json")
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Self {
        use std::fs;

        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<RenderSettings>(&contents) {
                Ok(settings) => {
                    info!("Loaded render settings from {:?}", path);
                    settings.validate()
                }
                Err(err) => {
                    warn!(
                        "Failed to parse {:?} ({}). Falling back to default render settings.",
                        path, err
                    );
                    RenderSettings::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Render settings file {:?} not found. Using default settings.",
                    path
                );
                RenderSettings::default()
            }
            Err(err) => {
                warn!(
                    "Failed to read {:?} ({}). Falling back to default render settings.",
                    path, err
                );
                RenderSettings::default()
            }
        }
    }

    fn validate(mut self) -> Self {
        if !matches!(self.sample_count, 1 | 2 | 4 | 8) {
            warn!(
                "Sample count {} is not a supported MSAA count. Using {} instead.",
                self.sample_count,
                Self::default_sample_count()
            );
            self.sample_count = Self::default_sample_count();
        }

        if self.shadow_map_size == 0 {
            warn!("Shadow map size must be greater than zero. Using default value.");
            self.shadow_map_size = Self::default_shadow_map_size();
        }

        if self.resolution.width == 0 || self.resolution.height == 0 {
            warn!("Resolution must be greater than zero. Using default resolution.");
            self.resolution = Resolution::default();
        }

        self
    }

    pub fn present_mode(&self, available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
        let desired = self.present_mode.to_vk();
        if available.contains(&desired) {
            return desired;
        }

        // FIFO support is mandated by the Vulkan spec
        warn!(
            "Requested present mode {:?} is not supported. Falling back to FIFO.",
            desired
        );
        vk::PresentModeKHR::FIFO
    }

    pub fn sample_count_flags(&self) -> vk::SampleCountFlags {
        match self.sample_count {
            1 => vk::SampleCountFlags::TYPE_1,
            2 => vk::SampleCountFlags::TYPE_2,
            8 => vk::SampleCountFlags::TYPE_8,
            _ => vk::SampleCountFlags::TYPE_4,
        }
    }

    const fn default_sample_count() -> u32 {
        4
    }

    const fn default_shadow_map_size() -> u32 {
        4096
    }

    fn default_cache_dir() -> PathBuf {
        PathBuf::from("cache")
    }

    fn default_scenes() -> Vec<PathBuf> {
        vec![PathBuf::from("assets/sponza/Sponza.gltf")]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentModeSetting {
    #[default]
    Fifo,
    FifoRelaxed,
    Immediate,
    Mailbox,
}

impl PresentModeSetting {
    fn to_vk(&self) -> vk::PresentModeKHR {
        match self {
            PresentModeSetting::Fifo => vk::PresentModeKHR::FIFO,
            PresentModeSetting::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
            PresentModeSetting::Immediate => vk::PresentModeKHR::IMMEDIATE,
            PresentModeSetting::Mailbox => vk::PresentModeKHR::MAILBOX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invalid_settings() -> RenderSettings {
        RenderSettings {
            sample_count: 3,
            shadow_map_size: 0,
            resolution: Resolution {
                width: 0,
                height: 0,
            },
            ..RenderSettings::default()
        }
    }

    #[test]
    fn validate_replaces_invalid_values_with_defaults() {
        let validated = invalid_settings().validate();

        assert_eq!(
            validated.sample_count,
            RenderSettings::default().sample_count
        );
        assert_eq!(
            validated.shadow_map_size,
            RenderSettings::default().shadow_map_size
        );
        assert_eq!(validated.resolution.width, Resolution::default().width);
        assert_eq!(validated.resolution.height, Resolution::default().height);
    }

    #[test]
    fn validate_preserves_valid_values() {
        let valid = RenderSettings {
            sample_count: 8,
            shadow_map_size: 2048,
            resolution: Resolution {
                width: 1280,
                height: 720,
            },
            ..RenderSettings::default()
        };

        let validated = valid.clone().validate();

        assert_eq!(validated.sample_count, valid.sample_count);
        assert_eq!(validated.shadow_map_size, valid.shadow_map_size);
        assert_eq!(validated.resolution.width, valid.resolution.width);
    }

    #[test]
    fn present_mode_returns_desired_when_available() {
        let settings = RenderSettings {
            present_mode: PresentModeSetting::Mailbox,
            ..RenderSettings::default()
        };

        let available = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];

        assert_eq!(
            settings.present_mode(&available),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn present_mode_falls_back_to_fifo_when_desired_missing() {
        let settings = RenderSettings {
            present_mode: PresentModeSetting::Mailbox,
            ..RenderSettings::default()
        };

        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];

        assert_eq!(settings.present_mode(&available), vk::PresentModeKHR::FIFO);
    }
}
