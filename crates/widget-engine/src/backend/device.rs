//! Output device discovery and selection over CPAL.

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

/// Output device summary for the device listing endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub default: bool,
    pub min_rate: u32,
    pub max_rate: u32,
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    !needle.is_empty() && name.to_lowercase().contains(&needle.to_lowercase())
}

fn device_name(device: &cpal::Device) -> Option<String> {
    device.description().ok().map(|d| d.name().to_string())
}

/// First output device whose name contains `needle` (case-insensitive), or the default device.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        return host
            .output_devices()
            .context("no output devices")?
            .find(|d| device_name(d).is_some_and(|n| matches_device_name(&n, needle)))
            .ok_or_else(|| anyhow!("no output device matched: {needle}"));
    }
    host.default_output_device()
        .ok_or_else(|| anyhow!("no default output device"))
}

/// Best output config, preferring stereo float at the device's default rate.
pub fn pick_output_config(device: &cpal::Device) -> Result<cpal::SupportedStreamConfig> {
    let default = device
        .default_output_config()
        .context("no default output config")?;
    let rate = default.sample_rate();
    let best = device
        .supported_output_configs()
        .context("output configs unavailable")?
        .filter(|range| range.min_sample_rate() <= rate && rate <= range.max_sample_rate())
        .min_by_key(|range| (channel_rank(range.channels()), format_rank(range.sample_format())))
        .map(|range| range.with_sample_rate(rate));
    Ok(best.unwrap_or(default))
}

fn channel_rank(channels: u16) -> u16 {
    match channels {
        2 => 0,
        1 => 1,
        n => n,
    }
}

fn format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

pub fn list_devices(host: &cpal::Host) -> Result<Vec<DeviceInfo>> {
    let default_name = host.default_output_device().as_ref().and_then(device_name);
    let mut out = Vec::new();
    for device in host.output_devices().context("no output devices")? {
        let Some(name) = device_name(&device) else {
            continue;
        };
        let (mut min_rate, mut max_rate) = (u32::MAX, 0);
        if let Ok(ranges) = device.supported_output_configs() {
            for range in ranges {
                min_rate = min_rate.min(range.min_sample_rate());
                max_rate = max_rate.max(range.max_sample_rate());
            }
        }
        if max_rate == 0 || min_rate > max_rate {
            match device.default_output_config() {
                Ok(config) => {
                    min_rate = config.sample_rate();
                    max_rate = min_rate;
                }
                Err(err) => {
                    tracing::debug!(device = %name, error = %err, "skipping device without usable rates");
                    continue;
                }
            }
        }
        out.push(DeviceInfo {
            default: default_name.as_deref() == Some(name.as_str()),
            name,
            min_rate,
            max_rate,
        });
    }
    Ok(out)
}
