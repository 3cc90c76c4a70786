use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::classifier::ClassifierConfig;
use crate::efficientnet::FEATURES_LAYER;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Diabetic retinopathy grading with Grad-CAM explanations", long_about = None)]
pub struct Cli {
    /// Log filter, e.g. `info` or `retinoscan=debug,tower_http=info`
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the REST API
    Serve(ServeArgs),
    /// Grade a single image from disk
    Predict(PredictArgs),
}

/// Model options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Checkpoint path (.pth state dict or .mpk record)
    #[arg(long, env = "MODEL_PATH", default_value = "models/best_model.pth")]
    pub model: PathBuf,

    /// Layer Grad-CAM reads activations from
    #[arg(long, env = "GRADCAM_LAYER", default_value = FEATURES_LAYER)]
    pub gradcam_layer: String,
}

impl ModelArgs {
    pub fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig::default().with_gradcam_layer(self.gradcam_layer.clone())
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Host to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Allowed CORS origin, `*` for any
    #[arg(long, env = "FRONTEND_ORIGIN", default_value = "*")]
    pub frontend_origin: String,
}

#[derive(Args, Debug, Clone)]
pub struct PredictArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// image path
    #[arg(long, required = true)]
    pub source: PathBuf,

    /// Directory for the Grad-CAM panel
    #[arg(long, default_value = "output")]
    pub output: PathBuf,

    /// Also render a Grad-CAM panel
    #[arg(long)]
    pub gradcam: bool,

    /// TTF/OTF font for panel titles
    #[arg(long)]
    pub font: Option<PathBuf>,

    /// rescale_1_255 or gaussian_filtered
    #[arg(long, default_value = "rescale_1_255")]
    pub preprocessing: String,
}
