// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::info;
use serde::{de::DeserializeOwned, Serialize};
use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

// "//" and "#" lines carry documentation and are blanked so that serde_json
// still reports the right line numbers.
fn read_json(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with("//") || trimmed.starts_with('#') {
                "\n".to_string()
            } else {
                format!("{}\n", line)
            }
        })
        .collect())
}

pub trait JsonLoad
where
    Self: DeserializeOwned,
{
    /// Called after deserialization, e.g. to validate.
    fn loaded(&mut self) -> Result<()> {
        Ok(())
    }

    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(serde_json::from_str(&read_json(path.as_ref())?)?)
    }
}

pub trait JsonSave
where
    Self: Default + Serialize,
{
    fn preamble() -> Option<String> {
        None
    }

    fn as_json(&self) -> Result<String> {
        let mut out = Self::preamble().unwrap_or_default();
        out += &serde_json::to_string_pretty(&self)?;
        if !out.ends_with('\n') {
            out.push('\n');
        }
        Ok(out)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.as_json()?)?;
        Ok(())
    }

    /// Writes the defaults to `path` unless it already exists. Returns
    /// whether the file was created.
    fn maybe_create_dfl(path: &Path) -> Result<bool> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = match fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        f.write_all(Self::default().as_json()?.as_bytes())?;
        Ok(true)
    }
}

#[derive(Debug)]
pub struct JsonConfigFile<T: JsonLoad + JsonSave> {
    pub path: Option<PathBuf>,
    pub data: T,
}

impl<T: JsonLoad + JsonSave> JsonConfigFile<T> {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut data = T::load(path).with_context(|| format!("loading {:?}", path))?;
        data.loaded()?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            data,
        })
    }

    /// Without a path, the defaults are used as-is.
    pub fn load_or_create<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        match path {
            Some(path) => {
                if T::maybe_create_dfl(path.as_ref())? {
                    info!("cfg: Created {:?}", path.as_ref());
                }
                Self::load(path)
            }
            None => {
                let mut data = T::default();
                data.loaded()?;
                Ok(Self { path: None, data })
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        match self.path.as_ref() {
            Some(path) => self.data.save(path),
            None => Ok(()),
        }
    }
}

/// Command line arguments which can be based on an args file. Options given
/// on the command line override the file and are written back to it.
pub trait JsonArgs
where
    Self: JsonLoad + JsonSave,
{
    fn match_cmdline() -> clap::ArgMatches<'static>;
    fn verbosity(matches: &clap::ArgMatches) -> u32;
    /// Returns whether a value which belongs in the args file changed.
    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> Result<bool>;
}

pub trait JsonArgsHelper
where
    Self: JsonArgs,
{
    fn init_args_and_logging() -> Result<JsonConfigFile<Self>>;
}

impl<T: JsonArgs> JsonArgsHelper for T {
    fn init_args_and_logging() -> Result<JsonConfigFile<T>> {
        let matches = T::match_cmdline();
        super::init_logging(T::verbosity(&matches));

        let mut args_file = JsonConfigFile::<T>::load_or_create(matches.value_of("args"))?;
        if args_file.data.process_cmdline(&matches)? {
            if let Some(path) = args_file.path.as_ref() {
                info!("cfg: Updating args file {:?}", path);
                args_file.save()?;
            }
        }
        Ok(args_file)
    }
}

/// Output file which is replaced as a whole on each commit so that readers
/// never see a partial write.
#[derive(Debug)]
pub struct JsonReportFile<T: JsonSave> {
    pub path: Option<PathBuf>,
    pub data: T,
}

impl<T: JsonSave> JsonReportFile<T> {
    pub fn new<P: AsRef<Path>>(path: Option<P>) -> Self {
        Self {
            path: path.map(|p| p.as_ref().to_path_buf()),
            data: T::default(),
        }
    }

    pub fn commit(&self) -> Result<()> {
        let path = match self.path.as_ref() {
            Some(v) => v,
            None => return Ok(()),
        };
        let mut staging = OsString::from(path.as_os_str());
        staging.push(".staging");

        self.data.save(&staging)?;
        fs::rename(&staging, path)?;
        Ok(())
    }
}
