use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use emotion_core::{DetectorVariant, ExpressionModel, FacePipeline, GrayFrame, ModelArtifacts};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "emotion", about = "Facial expression analysis CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect faces in a photo and print the dominant emotion
    Analyze {
        /// Image file (JPEG, PNG, WebP, ...)
        photo: PathBuf,
        /// Directory containing the ONNX models
        #[arg(long, default_value_os_t = emotion_core::default_model_dir())]
        model_dir: PathBuf,
        /// Use the larger det_10g detector instead of det_500m
        #[arg(long)]
        accurate: bool,
        /// Print every detected face, not only the summary
        #[arg(long)]
        faces: bool,
    },
    /// Check that the model files exist and load
    Models {
        /// Directory containing the ONNX models
        #[arg(long, default_value_os_t = emotion_core::default_model_dir())]
        model_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            photo,
            model_dir,
            accurate,
            faces,
        } => analyze(photo, model_dir, accurate, faces),
        Commands::Models { model_dir } => models(model_dir),
    }
}

fn analyze(photo: PathBuf, model_dir: PathBuf, accurate: bool, print_faces: bool) -> Result<()> {
    let variant = if accurate {
        DetectorVariant::Accurate
    } else {
        DetectorVariant::Fast
    };
    let bytes =
        std::fs::read(&photo).with_context(|| format!("reading {}", photo.display()))?;
    let frame = GrayFrame::decode(&bytes)
        .with_context(|| format!("decoding {}", photo.display()))?;

    let artifacts = ModelArtifacts::in_dir(&model_dir, variant);
    let mut pipeline = FacePipeline::load(&artifacts).context("loading models")?;
    let faces = pipeline.analyze(&frame).context("running inference")?;

    if print_faces {
        for (i, face) in faces.iter().enumerate() {
            let (label, score) = face.expressions.dominant();
            println!(
                "face {i}: box=({:.0},{:.0} {:.0}x{:.0}) det={:.2} {label} {:.1}%",
                face.bbox.x,
                face.bbox.y,
                face.bbox.width,
                face.bbox.height,
                face.bbox.confidence,
                score * 100.0
            );
        }
    }

    let result = emotion_core::summarize(&faces);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Model files found missing in a model directory.
#[derive(Debug, Default)]
struct ModelReport {
    /// Files the service cannot run without: fast detector and classifier.
    required_missing: Vec<PathBuf>,
    /// Accurate detector; only the CLI's `--accurate` uses it.
    optional_missing: Vec<PathBuf>,
}

impl ModelReport {
    fn inspect(model_dir: &Path) -> Self {
        let required = ModelArtifacts::in_dir(model_dir, DetectorVariant::Fast);
        let accurate = ModelArtifacts::in_dir(model_dir, DetectorVariant::Accurate);
        Self {
            required_missing: required.missing().into_iter().map(Path::to_path_buf).collect(),
            optional_missing: accurate
                .missing()
                .into_iter()
                .filter(|p| *p == accurate.detector.as_path())
                .map(Path::to_path_buf)
                .collect(),
        }
    }

    fn is_usable(&self) -> bool {
        self.required_missing.is_empty()
    }
}

fn models(model_dir: PathBuf) -> Result<()> {
    let report = ModelReport::inspect(&model_dir);
    for path in &report.required_missing {
        println!("missing (required): {}", path.display());
    }
    for path in &report.optional_missing {
        println!("missing (optional, --accurate only): {}", path.display());
    }
    if !report.is_usable() {
        anyhow::bail!("required models missing in {}", model_dir.display());
    }

    let fast = ModelArtifacts::in_dir(&model_dir, DetectorVariant::Fast);
    FacePipeline::load(&fast)
        .with_context(|| format!("loading {}", fast.detector.display()))?;
    println!("Fast: ok ({})", fast.detector.display());

    if report.optional_missing.is_empty() {
        let accurate = ModelArtifacts::in_dir(&model_dir, DetectorVariant::Accurate);
        match FacePipeline::load(&accurate) {
            Ok(_) => println!("Accurate: ok ({})", accurate.detector.display()),
            Err(e) => println!("Accurate: failed to load: {e}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_analyze_defaults() {
        let cli = Cli::try_parse_from(["emotion", "analyze", "me.jpg"]).unwrap();
        match cli.command {
            Commands::Analyze {
                photo,
                model_dir,
                accurate,
                faces,
            } => {
                assert_eq!(photo, PathBuf::from("me.jpg"));
                assert_eq!(model_dir, PathBuf::from("models"));
                assert!(!accurate);
                assert!(!faces);
            }
            Commands::Models { .. } => panic!("expected analyze"),
        }
    }

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn test_accurate_detector_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "det_500m.onnx");
        touch(dir.path(), "face_expression.onnx");

        let report = ModelReport::inspect(dir.path());
        assert!(report.is_usable());
        assert!(report.required_missing.is_empty());
        assert_eq!(report.optional_missing, vec![dir.path().join("det_10g.onnx")]);
    }

    #[test]
    fn test_missing_fast_detector_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "det_10g.onnx");
        touch(dir.path(), "face_expression.onnx");

        let report = ModelReport::inspect(dir.path());
        assert!(!report.is_usable());
        assert_eq!(report.required_missing, vec![dir.path().join("det_500m.onnx")]);
        assert!(report.optional_missing.is_empty());
    }

    #[test]
    fn test_models_fails_on_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let report = ModelReport::inspect(dir.path());
        assert_eq!(report.required_missing.len(), 2);

        let err = models(dir.path().to_path_buf()).unwrap_err();
        assert!(err.to_string().contains("required models missing"));
    }

    #[test]
    fn test_analyze_missing_photo_fails() {
        let dir = std::env::temp_dir().join("emotion-cli-test-no-models");
        let err = analyze(dir.join("absent.jpg"), dir, false, false).unwrap_err();
        assert!(err.to_string().contains("reading"));
    }
}
