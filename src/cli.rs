use artcache::{Cache, CacheConfig, CacheError, HashAlgorithm, Result};
use clap::{Args, Parser, Subcommand};
use std::{
    ffi::OsString,
    fs::File,
    io,
    path::PathBuf,
    process::Command,
};

#[derive(Parser, Debug)]
#[clap(version, about, author)]
pub struct Cli {
    /// Cache root, overriding the config file
    #[clap(long, env = "ARTCACHE_ROOT", global = true)]
    root: Option<PathBuf>,

    /// TOML config file
    #[clap(long, env = "ARTCACHE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Hash algorithm for fingerprints and blobs
    #[clap(long, value_enum, global = true)]
    algorithm: Option<HashAlgorithm>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// What identifies a cache entry.
#[derive(Args, Debug)]
pub struct KeyArgs {
    /// Operation tag, e.g. "compile"
    #[clap(long = "op", short = 'o')]
    operation: String,

    /// Source file read by the operation. Repeat in read order.
    #[clap(long = "src", short = 's')]
    sources: Vec<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the fingerprint of an operation over its sources
    #[clap(name = "fingerprint", aliases = &["fp"])]
    Fingerprint {
        #[clap(flatten)]
        key: KeyArgs,
    },

    /// Show whether an entry is cached, with its values
    #[clap(name = "lookup", aliases = &["l"])]
    Lookup {
        #[clap(flatten)]
        key: KeyArgs,
    },

    /// Store a file as the content of an entry
    #[clap(name = "put")]
    Put {
        #[clap(flatten)]
        key: KeyArgs,

        /// File whose bytes become the entry's content
        #[clap(long)]
        from: PathBuf,

        /// Attach a string value, as `name=value`
        #[clap(long = "set", value_parser = parse_assignment)]
        values: Vec<(String, String)>,
    },

    /// Link a cached entry's content to a destination
    #[clap(name = "install", aliases = &["i"])]
    Install {
        #[clap(flatten)]
        key: KeyArgs,

        #[clap(long)]
        dest: PathBuf,
    },

    /// Install from the cache, running a program to produce the content on a miss
    ///
    /// Every `{}` argument is replaced with the path the program must write to.
    #[clap(name = "exec", aliases = &["x"])]
    Exec {
        #[clap(flatten)]
        key: KeyArgs,

        #[clap(long)]
        dest: PathBuf,

        /// Program and arguments, after `--`
        #[clap(last = true, required = true)]
        command: Vec<String>,
    },

    /// Re-hash a stored blob and compare it with its name
    #[clap(name = "verify")]
    Verify {
        #[clap(value_parser)]
        hash: String,
    },
}

fn parse_assignment(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(name, value)| (name.to_owned(), value.to_owned()))
        .ok_or_else(|| format!("expected name=value, got {s:?}"))
}

impl Cli {
    /// Flags win over the config file, which wins over the defaults.
    fn resolve_config(&self) -> Result<CacheConfig> {
        let mut config = match &self.config {
            Some(path) => CacheConfig::load(path)?,
            None => CacheConfig::default(),
        };
        if let Some(root) = &self.root {
            config.root.clone_from(root);
        }
        if let Some(algorithm) = self.algorithm {
            config.algorithm = algorithm;
        }
        Ok(config)
    }

    pub fn run(self) -> Result<()> {
        let config = self.resolve_config()?;
        let cache = Cache::from_config(&config)?;
        tracing::trace!("Running command: {:?}", self.command);

        match self.command {
            Commands::Fingerprint { key } => {
                let key = cache.key(&key.operation, &key.sources)?;
                println!("{}", key.fingerprint());
                Ok(())
            }
            Commands::Lookup { key } => {
                let entry = match cache.lookup(cache.key(&key.operation, &key.sources)?) {
                    Ok(entry) => entry,
                    Err(e) if e.is_not_found() => {
                        println!("miss");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };

                println!("hit {}", entry.content_hash().unwrap_or("-"));
                for (name, value) in entry.values() {
                    println!("{name} = {value}");
                }
                Ok(())
            }
            Commands::Put { key, from, values } => {
                let mut entry = cache.entry(cache.key(&key.operation, &key.sources)?)?;
                if entry.has_content() {
                    tracing::info!(
                        fingerprint = entry.fingerprint(),
                        "Entry already has content, keeping it"
                    );
                }

                let mut input =
                    File::open(&from).map_err(|source| CacheError::SourceUnavailable {
                        path: from.clone(),
                        action: "open",
                        source,
                    })?;
                io::copy(&mut input, &mut entry).map_err(|source| CacheError::Io {
                    action: "copy input",
                    path: from.clone(),
                    source,
                })?;

                for (name, value) in values {
                    entry.store(&name, value)?;
                }

                let hash = entry.finalize()?;
                entry.save()?;
                println!("{}", hash.as_deref().unwrap_or("-"));
                Ok(())
            }
            Commands::Install { key, dest } => {
                let mut entry = cache.lookup(cache.key(&key.operation, &key.sources)?)?;
                match entry.install(&dest)? {
                    Some(kind) => println!("{} ({kind:?})", dest.display()),
                    None => println!("entry has no content"),
                }
                Ok(())
            }
            Commands::Exec { key, dest, command } => {
                let mut entry = cache.entry(cache.key(&key.operation, &key.sources)?)?;

                if entry.has_content() {
                    tracing::info!(
                        fingerprint = entry.fingerprint(),
                        "Cache hit, not running producer"
                    );
                } else {
                    let Some((program, args)) = command.split_first() else {
                        return Err(CacheError::Producer {
                            path: dest,
                            source: io::Error::new(
                                io::ErrorKind::InvalidInput,
                                "no program given",
                            ),
                        });
                    };
                    entry.write_with(|staged| run_producer(program, args, staged.as_os_str()))?;
                }

                match entry.install(&dest)? {
                    Some(kind) => println!("{} ({kind:?})", dest.display()),
                    None => println!("producer wrote no output"),
                }
                Ok(())
            }
            Commands::Verify { hash } => {
                verify_blob(&cache, &hash)?;
                println!("ok {hash}");
                Ok(())
            }
        }
    }
}

/// Checks that `hash` is a well-formed digest and that its blob still
/// hashes to it.
fn verify_blob(cache: &Cache, hash: &str) -> Result<()> {
    if !cache.algorithm().is_digest(hash) {
        return Err(CacheError::InvalidDigest {
            value: hash.to_owned(),
            algorithm: cache.algorithm().name(),
        });
    }
    cache.blobs().check(hash)
}

/// Runs `program`, substituting `{}` arguments with the staged output path.
fn run_producer(program: &str, args: &[String], output: &std::ffi::OsStr) -> io::Result<()> {
    let args = args.iter().map(|arg| {
        if arg == "{}" {
            output.to_owned()
        } else {
            OsString::from(arg)
        }
    });

    tracing::debug!(program, "Running producer");
    let status = Command::new(program).args(args).status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("{program} exited with {status}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            parse_assignment("package=net/http").unwrap(),
            ("package".to_owned(), "net/http".to_owned())
        );
        assert_eq!(
            parse_assignment("expr=a=b").unwrap(),
            ("expr".to_owned(), "a=b".to_owned())
        );
        assert!(parse_assignment("no-equals").is_err());
    }

    #[test]
    fn test_exec_collects_trailing_command() {
        let cli = Cli::try_parse_from([
            "artcache", "exec", "-o", "gen", "-s", "a.src", "-s", "b.src", "--dest", "out",
            "--", "cp", "a.src", "{}",
        ])
        .unwrap();

        let Commands::Exec { key, dest, command } = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(key.operation, "gen");
        assert_eq!(key.sources, vec![PathBuf::from("a.src"), PathBuf::from("b.src")]);
        assert_eq!(dest, PathBuf::from("out"));
        assert_eq!(command, vec!["cp", "a.src", "{}"]);
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("artcache.toml");
        std::fs::write(&config_path, "root = \"/from/file\"\nalgorithm = \"sha512\"\n").unwrap();

        let args: Vec<OsString> = vec![
            "artcache".into(),
            "--config".into(),
            config_path.into(),
            "--root".into(),
            dir.path().into(),
            "verify".into(),
            "00".into(),
        ];
        let cli = Cli::try_parse_from(args).unwrap();

        let config = cli.resolve_config().unwrap();
        assert_eq!(config.root.as_path(), dir.path());
        assert_eq!(config.algorithm, HashAlgorithm::Sha512);
    }

    #[test]
    fn test_verify_blob_reports_each_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = Cache::open(dir.path(), HashAlgorithm::Sha256).unwrap();

        assert!(matches!(
            verify_blob(&cache, "not-hex"),
            Err(CacheError::InvalidDigest { .. })
        ));

        let good = HashAlgorithm::Sha256.hash_bytes(b"kept");
        std::fs::write(cache.blobs().blob_path(&good), b"kept").unwrap();
        verify_blob(&cache, &good).unwrap();

        let bad = HashAlgorithm::Sha256.hash_bytes(b"expected");
        std::fs::write(cache.blobs().blob_path(&bad), b"altered").unwrap();
        assert!(matches!(
            verify_blob(&cache, &bad),
            Err(CacheError::BlobMismatch { .. })
        ));
    }

    #[test]
    fn test_producer_substitutes_output_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("produced");

        run_producer("touch", &["{}".to_owned()], out.as_os_str()).unwrap();
        assert!(out.exists());
    }

    #[test]
    fn test_producer_failure_reports_status() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = run_producer("false", &[], dir.path().as_os_str()).unwrap_err();
        assert!(err.to_string().contains("false exited"));
    }
}
