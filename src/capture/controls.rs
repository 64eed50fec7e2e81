//! Camera control presets applied after format negotiation.

use anyhow::{anyhow, Context, Result};

use super::{CaptureDevice, DeviceTuner};

/// Well-known UVC control names and their V4L2 ids.
pub const KNOWN_CONTROLS: &[(&str, u32)] = &[
    ("brightness", 0x0098_0900),
    ("contrast", 0x0098_0901),
    ("saturation", 0x0098_0902),
    ("white_balance_auto", 0x0098_090c),
    ("gain", 0x0098_0913),
    ("power_line_frequency", 0x0098_0918),
    ("sharpness", 0x0098_091b),
    ("exposure_auto", 0x009a_0901),
    ("exposure_absolute", 0x009a_0902),
    ("exposure_auto_priority", 0x009a_0903),
    ("focus_absolute", 0x009a_090a),
    ("focus_auto", 0x009a_090c),
];

/// Looks up a control id by name (case-insensitive, `-` and `_` equivalent).
pub fn control_id(name: &str) -> Option<u32> {
    let normalized = name.trim().to_ascii_lowercase().replace('-', "_");
    KNOWN_CONTROLS
        .iter()
        .find(|(known, _)| *known == normalized)
        .map(|(_, id)| *id)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlSetting {
    pub id: u32,
    pub value: i32,
    /// Name used in logs and errors.
    pub label: String,
}

impl ControlSetting {
    pub fn named(name: &str, value: i32) -> Result<Self> {
        let id = control_id(name).ok_or_else(|| anyhow!("unknown camera control {:?}", name))?;
        Ok(Self {
            id,
            value,
            label: name.to_string(),
        })
    }

    pub fn raw(id: u32, value: i32) -> Self {
        Self {
            id,
            value,
            label: format!("{:#010x}", id),
        }
    }
}

/// Ordered list of controls, applied in sequence. The first failure aborts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControlPreset {
    settings: Vec<ControlSetting>,
}

impl ControlPreset {
    pub fn new(settings: Vec<ControlSetting>) -> Self {
        Self { settings }
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    pub fn settings(&self) -> &[ControlSetting] {
        &self.settings
    }
}

impl DeviceTuner for ControlPreset {
    fn tune(&mut self, device: &mut dyn CaptureDevice) -> Result<()> {
        for setting in &self.settings {
            device
                .set_control(setting.id, setting.value)
                .with_context(|| {
                    format!(
                        "set {} = {} on {}",
                        setting.label,
                        setting.value,
                        device.name()
                    )
                })?;
            log::debug!("{}: {} = {}", device.name(), setting.label, setting.value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::{Faults, SyntheticConfig, SyntheticDevice};

    #[test]
    fn control_names_resolve() {
        assert_eq!(control_id("focus_auto"), Some(0x009a_090c));
        assert_eq!(control_id("Exposure-Absolute"), Some(0x009a_0902));
        assert_eq!(control_id("zoom_warp"), None);
        assert!(ControlSetting::named("zoom_warp", 1).is_err());
    }

    #[test]
    fn preset_applies_controls_in_order() {
        let mut device = SyntheticDevice::new(SyntheticConfig::small("stub://controls"));
        let probe = device.probe();
        let mut preset = ControlPreset::new(vec![
            ControlSetting::named("focus_auto", 0).unwrap(),
            ControlSetting::named("focus_absolute", 0).unwrap(),
            ControlSetting::raw(0x009a_0901, 1),
        ]);
        preset.tune(&mut device).unwrap();
        assert_eq!(
            probe.controls(),
            vec![(0x009a_090c, 0), (0x009a_090a, 0), (0x009a_0901, 1)]
        );
    }

    #[test]
    fn rejected_control_aborts_preset() {
        let mut device = SyntheticDevice::new(SyntheticConfig::small("stub://controls"))
            .with_faults(Faults {
                reject_controls: vec![0x0098_0913],
                ..Faults::default()
            });
        let probe = device.probe();
        let mut preset = ControlPreset::new(vec![
            ControlSetting::named("gain", 10).unwrap(),
            ControlSetting::named("brightness", 5).unwrap(),
        ]);
        let err = preset.tune(&mut device).unwrap_err();
        assert!(err.to_string().contains("gain"));
        assert!(probe.controls().is_empty());
    }
}
