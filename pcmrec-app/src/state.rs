//! Shared host state handed to every console command.

use std::path::PathBuf;

use parking_lot::Mutex;
use pcmrec_core::PcmRecorder;

use crate::settings::{save_settings, AppSettings};

pub struct AppState {
    pub recorder: PcmRecorder,
    pub settings: Mutex<AppSettings>,
    /// `None` keeps settings in memory only.
    pub settings_path: Option<PathBuf>,
}

impl AppState {
    pub fn new(recorder: PcmRecorder, settings: AppSettings, settings_path: Option<PathBuf>) -> Self {
        Self {
            recorder,
            settings: Mutex::new(settings),
            settings_path,
        }
    }

    /// Apply `update`, normalize, persist and push the capture settings to
    /// the recorder. Returns the settings as stored.
    pub fn update_settings<F>(&self, update: F) -> anyhow::Result<AppSettings>
    where
        F: FnOnce(&mut AppSettings),
    {
        let mut settings = self.settings.lock();
        update(&mut settings);
        settings.normalize();
        if let Some(path) = &self.settings_path {
            save_settings(path, &settings)?;
        }
        self.recorder.configure(
            settings.sample_rate,
            settings.source,
            settings.prerecord_seconds,
        )?;
        Ok(settings.clone())
    }
}
