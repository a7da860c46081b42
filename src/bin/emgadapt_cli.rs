//! Offline tools for session output.
//!
//! Examples:
//!   emgadapt-cli inspect ~/.local/share/emgadapt/sessions/session-1700000000000/memory
//!   emgadapt-cli inspect memory/ --json
//!   emgadapt-cli refit memory/ model_pre.emgm model_refit.emgm
//!   emgadapt-cli refit memory/ model_pre.emgm model_refit.emgm --full
//!   emgadapt-cli eval memory/ model_post.emgm

use std::path::Path;
use std::process;

use emgadapt::classifier::{predict_batch, Checkpoint, Classifier, Head};
use emgadapt::memory::{ClassId, Memory};

fn usage() -> ! {
    eprintln!("emgadapt-cli (offline tools for adaptation sessions)");
    eprintln!("Usage: emgadapt-cli <command> [args]\n");
    eprintln!("Commands:");
    eprintln!("  inspect <memory_dir> [--json]       Summarise recorded memory");
    eprintln!("  refit <memory_dir> <model_in> <model_out> [--full]");
    eprintln!("                                      Fine-tune a checkpoint on a session");
    eprintln!("  eval <memory_dir> <model>           Accuracy against recorded context");
    process::exit(1);
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("Failed: {msg}");
    process::exit(1);
}

fn load_memory(dir: &Path) -> Memory {
    Memory::load_all(dir).unwrap_or_else(|e| fail(format!("{}: {e}", dir.display())))
}

fn load_model(path: &Path) -> Head {
    Head::load_checkpoint(path)
        .unwrap_or_else(|e| fail(format!("{}: {e}", path.display())))
}

fn per_class(labels: &[ClassId]) -> Vec<usize> {
    let n = labels.iter().max().map_or(0, |&m| m as usize + 1);
    let mut counts = vec![0; n];
    for &l in labels {
        counts[l as usize] += 1;
    }
    counts
}

fn inspect(dir: &Path, json: bool) {
    let snapshots = Memory::snapshot_indices(dir).unwrap_or_else(|e| fail(e));
    let mem = load_memory(dir);
    let (positive, negative) = mem.outcome_counts();
    let (_, labels) = mem.training_set();
    let classes = per_class(&labels);

    if json {
        let summary = serde_json::json!({
            "snapshots": snapshots.len(),
            "records": mem.len(),
            "dim": mem.dim(),
            "contextual": mem.has_context(),
            "positive": positive,
            "negative": negative,
            "per_class": classes,
        });
        println!("{summary}");
        return;
    }

    println!(
        "snapshots={} records={} dim={} contextual={}",
        snapshots.len(),
        mem.len(),
        mem.dim(),
        mem.has_context()
    );
    if mem.has_context() {
        let total = (positive + negative).max(1) as f32;
        println!(
            "outcomes: positive={} negative={} live_acc={:.1}%",
            positive,
            negative,
            positive as f32 / total * 100.0
        );
    }
    for (c, n) in classes.iter().enumerate() {
        println!("  class {c:>2}: {n}");
    }
}

fn refit(dir: &Path, model_in: &Path, model_out: &Path, full: bool) {
    let mem = load_memory(dir);
    if mem.is_empty() {
        fail(format!("no records in {}", dir.display()));
    }
    let mut model = load_model(model_in);
    let (x, y) = mem.training_set();
    let fitted = if full {
        model.refit(&x, mem.dim(), &y)
    } else {
        model.fit(&x, mem.dim(), &y)
    };
    fitted.unwrap_or_else(|e| fail(e));
    model
        .save_checkpoint(model_out)
        .unwrap_or_else(|e| fail(format!("{}: {e}", model_out.display())));
    println!(
        "fitted {} head on {} records -> {}",
        model.kind(),
        y.len(),
        model_out.display()
    );
}

fn eval(dir: &Path, model_path: &Path) {
    let mem = load_memory(dir);
    let model = load_model(model_path);
    let (x, y) = mem.training_set();
    if y.is_empty() {
        fail(format!("no labelled records in {}", dir.display()));
    }
    if mem.dim() != model.dim() {
        fail(format!(
            "memory has {} features, model expects {}",
            mem.dim(),
            model.dim()
        ));
    }
    let predicted = predict_batch(&model, &x, mem.dim());
    let correct = predicted.iter().zip(&y).filter(|(p, t)| p == t).count();
    println!(
        "accuracy={:.1}% ({}/{})",
        correct as f32 / y.len() as f32 * 100.0,
        correct,
        y.len()
    );
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        usage();
    }
    let flag = |name: &str| args.iter().any(|a| a == name);
    let positional: Vec<&Path> = args[1..]
        .iter()
        .filter(|a| !a.starts_with("--"))
        .map(Path::new)
        .collect();

    match (args[0].as_str(), positional.as_slice()) {
        ("inspect", [dir]) => inspect(dir, flag("--json")),
        ("refit", [dir, model_in, model_out]) => refit(dir, model_in, model_out, flag("--full")),
        ("eval", [dir, model]) => eval(dir, model),
        _ => usage(),
    }
}
