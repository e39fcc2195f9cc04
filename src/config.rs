use anyhow::Result;
use clap_serde_derive::ClapSerde;
use serde::Deserialize;

#[derive(ClapSerde, Deserialize, Debug)]
pub struct Config {
    /// The address the listener binds to
    #[arg(short, long, env, default_value = "0.0.0.0")]
    pub(crate) address: String,

    /// The port the listener binds to
    #[arg(short, long, env, default_value = "8000")]
    pub(crate) port: u16,

    /// The id of the Hugging Face repository holding the assertion model
    #[arg(
        long,
        env,
        default_value = "bvanaken/clinical-assertion-negation-bert"
    )]
    pub(crate) model_repo_id: String,

    /// The revision of the model repository
    #[arg(long, env, default_value = "main")]
    pub(crate) model_revision: String,

    /// The weights file inside the model repository
    #[arg(long, env, default_value = "pytorch_model.bin")]
    pub(crate) weights_filename: String,

    /// Maximum number of tokens fed to the model per sentence, longer input is truncated
    #[arg(long, env, default_value = "512")]
    pub(crate) max_input_tokens: usize,

    /// The device used for inference: cpu, cuda or metal
    #[arg(long, env, default_value = "cpu")]
    pub(crate) device: String,

    /// The OTLP endpoint traces and metrics are exported to
    #[arg(long, env)]
    pub(crate) otlp_endpoint: Option<String>,

    /// Log to the console even when an OTLP endpoint is set
    #[arg(long, env)]
    pub(crate) console: bool,
}

impl Config {
    pub fn from_toml(path: &str) -> Result<Self> {
        let str = std::fs::read_to_string(path)?;
        let config = toml::from_str(&str)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn parses_full_toml() {
        let raw = r#"
            address = "127.0.0.1"
            port = 8000
            model_repo_id = "bvanaken/clinical-assertion-negation-bert"
            model_revision = "main"
            weights_filename = "pytorch_model.bin"
            max_input_tokens = 128
            device = "cpu"
            console = true
        "#;

        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.address, "127.0.0.1");
        assert_eq!(config.port, 8000);
        assert_eq!(config.max_input_tokens, 128);
        assert!(config.otlp_endpoint.is_none());
        assert!(config.console);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::from_toml("does-not-exist.toml").is_err());
    }
}
