//! Checkpoint sets: `<iter>-G`, `<iter>-D` and `<iter>-sp` safetensors files.
//!
//! A set is written and restored as a unit. Saving stages every file as
//! `*.partial` and renames only after all three are on disk; loading
//! validates all three files before touching any parameter.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;

use crate::model::{Networks, lock_vars};
use crate::{Error, Result};

const SUFFIXES: [&str; 3] = ["G", "D", "sp"];
const PARTIAL_EXT: &str = "partial";
const PREVIOUS_EXT: &str = "prev";

/// Final paths of the set for `iteration`, in `[G, D, sp]` order.
pub fn checkpoint_paths(dir: &Path, iteration: usize) -> [PathBuf; 3] {
    SUFFIXES.map(|s| dir.join(format!("{iteration}-{s}.safetensors")))
}

fn stores(nets: &Networks) -> [&VarMap; 3] {
    [&nets.g_vars, &nets.d_vars, &nets.e_vars]
}

fn side_path(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// Write the checkpoint set for `iteration` into `dir`.
///
/// On failure the directory is left as it was: no file of the new set
/// remains, and a set previously saved for the same iteration is restored.
pub fn save_checkpoint(dir: &Path, iteration: usize, nets: &Networks) -> Result<()> {
    let finals = checkpoint_paths(dir, iteration);
    let partials = finals.clone().map(|p| side_path(&p, PARTIAL_EXT));

    let staged = stores(nets)
        .iter()
        .zip(&partials)
        .try_for_each(|(vars, path)| vars.save(path));
    if let Err(e) = staged {
        remove_all(&partials);
        return Err(Error::Checkpoint(format!(
            "writing iteration {iteration} to {}: {e}",
            dir.display()
        )));
    }

    commit(&partials, &finals, |from, to| std::fs::rename(from, to))?;
    tracing::info!(iteration, dir = %dir.display(), "saved model checkpoints");
    Ok(())
}

/// Move staged files onto their final names as one unit.
///
/// Existing finals are first renamed to `*.prev`; any failure undoes the
/// moves made so far and puts them back.
fn commit<F>(partials: &[PathBuf; 3], finals: &[PathBuf; 3], mut rename: F) -> Result<()>
where
    F: FnMut(&Path, &Path) -> std::io::Result<()>,
{
    let previous = finals.clone().map(|p| side_path(&p, PREVIOUS_EXT));
    let mut moved_aside = Vec::new();
    for (dest, prev) in finals.iter().zip(&previous) {
        if !dest.exists() {
            continue;
        }
        if let Err(e) = rename(dest, prev) {
            restore(&moved_aside, &mut rename);
            remove_all(partials);
            return Err(Error::Checkpoint(format!("moving aside {}: {e}", dest.display())));
        }
        moved_aside.push((prev.clone(), dest.clone()));
    }

    for (i, (partial, dest)) in partials.iter().zip(finals).enumerate() {
        if let Err(e) = rename(partial, dest) {
            remove_all(&finals[..i]);
            remove_all(partials);
            restore(&moved_aside, &mut rename);
            return Err(Error::Checkpoint(format!("committing {}: {e}", dest.display())));
        }
    }
    for (prev, _) in &moved_aside {
        if let Err(e) = std::fs::remove_file(prev) {
            tracing::debug!(path = %prev.display(), error = %e, "could not remove superseded checkpoint");
        }
    }
    Ok(())
}

fn restore<F>(moved_aside: &[(PathBuf, PathBuf)], rename: &mut F)
where
    F: FnMut(&Path, &Path) -> std::io::Result<()>,
{
    for (prev, dest) in moved_aside {
        if let Err(e) = rename(prev, dest) {
            tracing::warn!(path = %dest.display(), error = %e, "could not restore previous checkpoint");
        }
    }
}

fn remove_all(paths: &[PathBuf]) {
    for path in paths {
        let _ = std::fs::remove_file(path);
    }
}

/// Restore all three networks from the set saved at `iteration`.
///
/// Fails without modifying any parameter if a file is missing, unreadable,
/// or does not match the networks' parameter names and shapes.
pub fn load_checkpoint(dir: &Path, iteration: usize, nets: &Networks) -> Result<()> {
    let paths = checkpoint_paths(dir, iteration);
    if let Some(missing) = paths.iter().find(|p| !p.is_file()) {
        return Err(Error::Checkpoint(format!(
            "iteration {iteration} is incomplete: {} not found",
            missing.display()
        )));
    }

    let mut loaded = Vec::with_capacity(3);
    for (vars, path) in stores(nets).into_iter().zip(&paths) {
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .map_err(|e| Error::Checkpoint(format!("reading {}: {e}", path.display())))?;
        validate(vars, &tensors, path)?;
        loaded.push((vars, tensors));
    }

    for (vars, tensors) in loaded {
        let vars = lock_vars(vars)?;
        for (name, var) in vars.iter() {
            let value = tensors[name].to_device(var.device())?.to_dtype(var.dtype())?;
            var.set(&value)?;
        }
    }
    tracing::info!(iteration, dir = %dir.display(), "restored model checkpoints");
    Ok(())
}

fn validate(vars: &VarMap, tensors: &HashMap<String, Tensor>, path: &Path) -> Result<()> {
    let vars = lock_vars(vars)?;
    for (name, var) in vars.iter() {
        let tensor = tensors.get(name).ok_or_else(|| {
            Error::Checkpoint(format!("{} has no parameter {name}", path.display()))
        })?;
        if tensor.dims() != var.dims() {
            return Err(Error::Checkpoint(format!(
                "{}: {name} has shape {:?}, network expects {:?}",
                path.display(),
                tensor.dims(),
                var.dims()
            )));
        }
    }
    if let Some(extra) = tensors.keys().find(|k| !vars.contains_key(*k)) {
        return Err(Error::Checkpoint(format!(
            "{} has unexpected parameter {extra}",
            path.display()
        )));
    }
    Ok(())
}

/// Iterations in `dir` with all three files present, ascending.
pub fn complete_iterations(dir: &Path) -> Result<Vec<usize>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut iterations: Vec<usize> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name.strip_suffix("-G.safetensors")?.parse::<usize>().ok()
        })
        .filter(|&iteration| checkpoint_paths(dir, iteration).iter().all(|p| p.is_file()))
        .collect();
    iterations.sort_unstable();
    Ok(iterations)
}

/// Most recent complete iteration, if any.
pub fn latest_iteration(dir: &Path) -> Result<Option<usize>> {
    Ok(complete_iterations(dir)?.last().copied())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::context::Context;

    fn tiny(style_dim: usize) -> ModelConfig {
        ModelConfig {
            num_mcep: 8,
            num_speakers: 2,
            style_dim,
            gen_conv_dim: 4,
            gen_repeat_num: 1,
            dis_conv_dim: 2,
            dis_repeat_num: 1,
            dis_embed_dim: 2,
            enc_conv_dim: 2,
            enc_max_dim: 4,
            enc_repeat_num: 1,
            ..Default::default()
        }
    }

    fn values(vars: &VarMap) -> Vec<(String, Vec<f32>)> {
        let vars = lock_vars(vars).unwrap();
        let mut out: Vec<_> = vars
            .iter()
            .map(|(k, v)| (k.clone(), v.flatten_all().unwrap().to_vec1::<f32>().unwrap()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Style of a fixed input under label 1, then its conversion with that
    /// style as both source and target.
    fn outputs(nets: &Networks) -> (Vec<f32>, Vec<f32>) {
        let x = Tensor::arange(0f32, 128.0, &Device::Cpu)
            .unwrap()
            .affine(0.01, -0.6)
            .unwrap()
            .reshape((1, 8, 16))
            .unwrap();
        let label = Tensor::new(&[1u32], &Device::Cpu).unwrap();
        let style = nets.style_encoder.forward(&x, &label).unwrap();
        let converted = nets.generator.forward(&x, &style, &style).unwrap();
        (
            style.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            converted.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
        )
    }

    #[test]
    fn test_roundtrip_restores_all_three() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::cpu();
        let saved = Networks::new(&tiny(4), &ctx, 1).unwrap();
        save_checkpoint(dir.path(), 20, &saved).unwrap();

        let restored = Networks::new(&tiny(4), &ctx, 2).unwrap();
        assert_ne!(values(&saved.g_vars), values(&restored.g_vars));
        assert_ne!(outputs(&saved), outputs(&restored));
        load_checkpoint(dir.path(), 20, &restored).unwrap();
        assert_eq!(values(&saved.g_vars), values(&restored.g_vars));
        assert_eq!(values(&saved.d_vars), values(&restored.d_vars));
        assert_eq!(values(&saved.e_vars), values(&restored.e_vars));
        assert_eq!(outputs(&saved), outputs(&restored));
        assert_eq!(complete_iterations(dir.path()).unwrap(), vec![20]);
    }

    #[test]
    fn test_no_partial_files_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let nets = Networks::new(&tiny(4), &Context::cpu(), 1).unwrap();
        save_checkpoint(dir.path(), 5, &nets).unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 3);
        assert!(names.iter().all(|n| !n.ends_with(".partial")));
    }

    #[test]
    fn test_missing_file_leaves_parameters_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::cpu();
        save_checkpoint(dir.path(), 10, &Networks::new(&tiny(4), &ctx, 1).unwrap()).unwrap();
        std::fs::remove_file(dir.path().join("10-sp.safetensors")).unwrap();

        let nets = Networks::new(&tiny(4), &ctx, 3).unwrap();
        let before = values(&nets.g_vars);
        let err = load_checkpoint(dir.path(), 10, &nets).unwrap_err();
        assert!(matches!(err, Error::Checkpoint(_)));
        assert_eq!(values(&nets.g_vars), before);
        assert!(complete_iterations(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_shape_mismatch_leaves_parameters_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::cpu();
        save_checkpoint(dir.path(), 10, &Networks::new(&tiny(4), &ctx, 1).unwrap()).unwrap();

        // wider style changes generator and encoder shapes; D is unaffected
        let nets = Networks::new(&tiny(6), &ctx, 3).unwrap();
        let before = (values(&nets.g_vars), values(&nets.d_vars));
        assert!(matches!(
            load_checkpoint(dir.path(), 10, &nets),
            Err(Error::Checkpoint(_))
        ));
        assert_eq!((values(&nets.g_vars), values(&nets.d_vars)), before);
    }

    #[test]
    fn test_failed_save_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let nets = Networks::new(&tiny(4), &Context::cpu(), 1).unwrap();
        let missing = dir.path().join("does/not/exist");
        assert!(save_checkpoint(&missing, 1, &nets).is_err());
        assert!(complete_iterations(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_failed_commit_restores_previous_set() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::cpu();
        let old = Networks::new(&tiny(4), &ctx, 1).unwrap();
        save_checkpoint(dir.path(), 10, &old).unwrap();

        let new = Networks::new(&tiny(4), &ctx, 2).unwrap();
        let finals = checkpoint_paths(dir.path(), 10);
        let partials = finals.clone().map(|p| side_path(&p, PARTIAL_EXT));
        for (vars, path) in stores(&new).iter().zip(&partials) {
            vars.save(path).unwrap();
        }

        // moves aside succeed, the second commit rename fails
        let mut calls = 0;
        let result = commit(&partials, &finals, |from, to| {
            calls += 1;
            if calls == 5 {
                return Err(std::io::Error::other("disk full"));
            }
            std::fs::rename(from, to)
        });
        assert!(matches!(result, Err(Error::Checkpoint(_))));

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 3, "{names:?}");
        let restored = Networks::new(&tiny(4), &ctx, 3).unwrap();
        load_checkpoint(dir.path(), 10, &restored).unwrap();
        assert_eq!(values(&restored.g_vars), values(&old.g_vars));
        assert_eq!(values(&restored.e_vars), values(&old.e_vars));
    }

    #[test]
    fn test_resave_replaces_set() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::cpu();
        save_checkpoint(dir.path(), 10, &Networks::new(&tiny(4), &ctx, 1).unwrap()).unwrap();
        let newer = Networks::new(&tiny(4), &ctx, 2).unwrap();
        save_checkpoint(dir.path(), 10, &newer).unwrap();

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 3);
        let restored = Networks::new(&tiny(4), &ctx, 3).unwrap();
        load_checkpoint(dir.path(), 10, &restored).unwrap();
        assert_eq!(values(&restored.d_vars), values(&newer.d_vars));
    }

    #[test]
    fn test_latest_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let nets = Networks::new(&tiny(4), &Context::cpu(), 1).unwrap();
        assert_eq!(latest_iteration(dir.path()).unwrap(), None);
        for iteration in [100, 20, 300] {
            save_checkpoint(dir.path(), iteration, &nets).unwrap();
        }
        std::fs::remove_file(dir.path().join("300-D.safetensors")).unwrap();
        assert_eq!(complete_iterations(dir.path()).unwrap(), vec![20, 100]);
        assert_eq!(latest_iteration(dir.path()).unwrap(), Some(100));
    }
}
