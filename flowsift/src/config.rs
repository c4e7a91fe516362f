use flow_filter::FilterSpec;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Default, Deserialize, Clone)]
pub struct ImportTuning {
    pub batch_size: Option<usize>,
    pub writers: Option<usize>,
    pub queue_depth: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    /// Store HTTP endpoint, e.g. `http://localhost:8123`.
    pub db_connection: Option<String>,
    #[serde(default)]
    pub filter: FilterSpec,
    pub import: Option<ImportTuning>,
}

pub fn load_config(path: Option<&Path>) -> Option<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new("flowsift.yaml");
            if p.exists() { p.to_path_buf() } else { return None; }
        }
    };
    let s = fs::read_to_string(path).ok()?;
    serde_yaml::from_str(&s).ok()
}
