use anyhow::{anyhow, bail, Context, Result};

pub(crate) const DEFAULT_ENDPOINT: &str = "http://localhost:8000";
pub(crate) const DEFAULT_PERIOD_MS: u64 = 1_000;
pub(crate) const DEFAULT_JPEG_QUALITY: u8 = 85;
pub(crate) const DEFAULT_CAPTURE_SIZE: (u32, u32) = (640, 480);
pub(crate) const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

#[derive(Clone, Debug)]
pub(crate) struct PipelineConfig {
    pub(crate) source_uri: String,
    pub(crate) endpoint: String,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) period_ms: u64,
    pub(crate) jpeg_quality: u8,
    pub(crate) listen: String,
    pub(crate) verbose: bool,
}

const USAGE: &str = "Usage: live-annotate [--source <uri>] [--endpoint <url>] \
[--width <px>] [--height <px>] [--period-ms <ms>] [--jpeg-quality <1-100>] \
[--listen <addr:port>] [--verbose]\n\nPositional form is also supported: \
live-annotate <source-uri> [endpoint]";

impl PipelineConfig {
    pub(crate) fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            bail!(USAGE);
        }

        let mut source_uri: Option<String> = None;
        let mut endpoint: Option<String> = None;
        let mut width: Option<u32> = None;
        let mut height: Option<u32> = None;
        let mut period_ms: Option<u64> = None;
        let mut jpeg_quality: Option<u8> = None;
        let mut listen: Option<String> = None;
        let mut verbose = false;
        let mut positional: Vec<String> = Vec::new();

        let mut idx = 1;
        while idx < args.len() {
            match args[idx].as_str() {
                "--source" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--source requires a value"))?
                        .clone();
                    source_uri = Some(value);
                    idx += 1;
                }
                "--endpoint" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--endpoint requires a value"))?
                        .clone();
                    endpoint = Some(value);
                    idx += 1;
                }
                "--width" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--width requires a value"))?
                        .parse::<u32>()
                        .with_context(|| "--width must be a positive integer".to_string())?;
                    if value == 0 {
                        bail!("--width must be a positive integer");
                    }
                    width = Some(value);
                    idx += 1;
                }
                "--height" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--height requires a value"))?
                        .parse::<u32>()
                        .with_context(|| "--height must be a positive integer".to_string())?;
                    if value == 0 {
                        bail!("--height must be a positive integer");
                    }
                    height = Some(value);
                    idx += 1;
                }
                "--period-ms" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--period-ms requires a value"))?
                        .parse::<u64>()
                        .with_context(|| "--period-ms must be a positive integer".to_string())?;
                    if value == 0 {
                        bail!("--period-ms must be at least 1");
                    }
                    period_ms = Some(value);
                    idx += 1;
                }
                "--jpeg-quality" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--jpeg-quality requires a value"))?
                        .parse::<u8>()
                        .with_context(|| {
                            "--jpeg-quality must be an integer between 1 and 100".to_string()
                        })?;
                    if !(1..=100).contains(&value) {
                        bail!("--jpeg-quality must be an integer between 1 and 100");
                    }
                    jpeg_quality = Some(value);
                    idx += 1;
                }
                "--listen" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--listen requires a value"))?
                        .clone();
                    listen = Some(value);
                    idx += 1;
                }
                "--verbose" => {
                    verbose = true;
                    idx += 1;
                }
                arg if arg.starts_with('-') => {
                    bail!("Unrecognised flag: {arg}");
                }
                other => {
                    positional.push(other.to_string());
                    idx += 1;
                }
            }
        }

        let mut positional = positional.into_iter();
        if source_uri.is_none() {
            source_uri = positional.next();
        }
        if endpoint.is_none() {
            endpoint = positional.next();
        }

        let source_uri = source_uri.ok_or_else(|| {
            anyhow!("Missing source. Provide --source <uri> or positional <source-uri>.")
        })?;
        let endpoint = endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        Ok(Self {
            source_uri,
            endpoint,
            width: width.unwrap_or(DEFAULT_CAPTURE_SIZE.0),
            height: height.unwrap_or(DEFAULT_CAPTURE_SIZE.1),
            period_ms: period_ms.unwrap_or(DEFAULT_PERIOD_MS),
            jpeg_quality: jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            listen: listen.unwrap_or_else(|| DEFAULT_LISTEN.to_string()),
            verbose,
        })
    }
}
