//! process-level configuration

pub mod cli {
    //! Parse from either cli or env var

    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "macondo-worker";
    /// the default path to config
    pub static DEFAULT_CONFIG_PATH: &str = "/etc/macondo/config.yaml";
    /// default log level. Can use this argument or MACONDO_LOG env var
    pub const DEFAULT_MACONDO_LOG: &str = "info";

    use std::{ffi::OsString, path::PathBuf};

    pub use clap::Parser;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "macondo", bin_name = "macondo", about, long_about = None)]
    /// parses from cli & environment var. macondo will load `.env` in the working dir as well
    pub struct Config {
        /// path to the discovery config (json or yaml)
        #[clap(
            short,
            long,
            value_parser,
            env,
            default_value = DEFAULT_CONFIG_PATH
        )]
        pub config_path: PathBuf,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// number of worker threads, defaults to the number of logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_MACONDO_LOG)]
        pub macondo_log: String,
    }

    impl Config {
        /// Load `.env` from the working dir, then parse `args` with env
        /// fallbacks. Variables already set in the environment win over `.env`.
        pub fn load_from<I, T>(args: I) -> (Self, dotenv::Result<PathBuf>)
        where
            I: IntoIterator<Item = T>,
            T: Into<OsString> + Clone,
        {
            let dotenv = dotenv::dotenv();
            (Self::parse_from(args), dotenv)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_dotenv_feeds_env_fallbacks() {
            let dir = std::env::temp_dir().join(format!("macondo-dotenv-{}", std::process::id()));
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(
                dir.join(".env"),
                "MACONDO_LOG=coordination=trace\nCONFIG_PATH=/srv/macondo/discovery.json\n",
            )
            .unwrap();
            std::env::set_current_dir(&dir).unwrap();
            // .env never overrides variables that are already set
            unsafe {
                std::env::remove_var("MACONDO_LOG");
                std::env::remove_var("CONFIG_PATH");
            }

            let (config, dotenv) = Config::load_from(["macondo"]);
            assert!(dotenv.unwrap().ends_with(".env"));
            assert_eq!(config.macondo_log, "coordination=trace");
            assert_eq!(
                config.config_path,
                PathBuf::from("/srv/macondo/discovery.json")
            );
        }

        #[test]
        fn test_cli_args() {
            let config = Config::try_parse_from([
                "macondo",
                "--config-path",
                "/tmp/macondo.json",
                "--threads",
                "2",
                "--macondo-log",
                "discovery=debug",
            ])
            .unwrap();
            assert_eq!(config.config_path, PathBuf::from("/tmp/macondo.json"));
            assert_eq!(config.threads, Some(2));
            assert_eq!(config.macondo_log, "discovery=debug");
        }

        #[test]
        fn test_bad_threads_rejected() {
            assert!(Config::try_parse_from(["macondo", "--threads", "lots"]).is_err());
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use env_parser::parse_var_with_err;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// log as "json", "pretty" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Installed log output
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LogFormat {
        Json,
        Pretty,
        Standard,
    }

    impl LogFormat {
        /// Unknown formats fall back to standard output.
        pub fn from_name(name: &str) -> Self {
            match name.trim() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                _ => LogFormat::Standard,
            }
        }
    }

    /// Configuration for the global subscriber
    #[derive(Debug)]
    pub struct Config {
        /// formatting applied to logs
        pub log_frmt: LogFormat,
    }

    impl Config {
        /// Install the global subscriber, filtering with `macondo_log`
        pub fn parse(macondo_log: &str) -> Result<Self> {
            let name: String = parse_var_with_err("LOG_FORMAT", DEFAULT_LOG_FORMAT)?;
            let log_frmt = LogFormat::from_name(&name);

            // Log level comes from MACONDO_LOG
            let filter = EnvFilter::try_new(macondo_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("h2=off".parse()?)
                .add_directive("tower=off".parse()?);

            match log_frmt {
                LogFormat::Json => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                LogFormat::Pretty => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                LogFormat::Standard => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_log_format_names() {
            assert_eq!(LogFormat::from_name("json"), LogFormat::Json);
            assert_eq!(LogFormat::from_name(" pretty "), LogFormat::Pretty);
            assert_eq!(LogFormat::from_name("standard"), LogFormat::Standard);
            assert_eq!(LogFormat::from_name("xml"), LogFormat::Standard);
        }
    }
}
