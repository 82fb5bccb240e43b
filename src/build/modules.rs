//! Out-of-tree modules hooked into `drivers/misc`.
//!
//! A module directory carries its own `Kconfig` and `Makefile`. It is copied
//! into the kernel tree and registered in the parent `Makefile` and `Kconfig`
//! so it builds like any in-tree misc driver. Registration is idempotent.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const MISC_DRIVERS: &str = "drivers/misc";

/// Hook every module under `custom_modules` into `kernel_root`.
///
/// `custom_modules` is either a single module (it has `Kconfig` and
/// `Makefile`) or a directory of modules. Returns the hooked module names.
pub fn add_modules(custom_modules: &Path, kernel_root: &Path) -> Result<Vec<String>> {
    if !custom_modules.is_dir() {
        bail!(
            "custom module directory '{}' does not exist",
            custom_modules.display()
        );
    }
    let single = custom_modules.join("Kconfig").is_file() && custom_modules.join("Makefile").is_file();
    let modules: Vec<PathBuf> = if single {
        vec![custom_modules.to_path_buf()]
    } else {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(custom_modules)
            .with_context(|| format!("reading '{}'", custom_modules.display()))?
        {
            let path = entry
                .with_context(|| format!("iterating '{}'", custom_modules.display()))?
                .path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        dirs
    };

    let mut names = Vec::new();
    for module in modules {
        names.push(add_module(&module, kernel_root)?);
    }
    Ok(names)
}

/// Copy one module into `drivers/misc` and register it.
pub fn add_module(module: &Path, kernel_root: &Path) -> Result<String> {
    let name = module
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("module path '{}' has no name", module.display()))?;
    let misc = kernel_root.join(MISC_DRIVERS);
    let dest = misc.join(&name);
    tracing::debug!("adding module {} to {}", name, misc.display());

    copy_tree(module, &dest)?;

    let kconfig = fs::read_to_string(dest.join("Kconfig"))
        .with_context(|| format!("reading Kconfig of module '{}'", name))?;
    let symbol = config_symbol(&kconfig)
        .with_context(|| format!("no 'config' entry in Kconfig of module '{}'", name))?;

    let makefile = misc.join("Makefile");
    let obj_line = format!("obj-$({}) += {}/", symbol, name);
    let content = fs::read_to_string(&makefile)
        .with_context(|| format!("reading '{}'", makefile.display()))?;
    if !content.contains(&obj_line) {
        let mut updated = content;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&obj_line);
        updated.push('\n');
        fs::write(&makefile, updated)
            .with_context(|| format!("writing '{}'", makefile.display()))?;
    }

    let kconfig_path = misc.join("Kconfig");
    let source_line = format!("source \"{}/{}/Kconfig\"", MISC_DRIVERS, name);
    let content = fs::read_to_string(&kconfig_path)
        .with_context(|| format!("reading '{}'", kconfig_path.display()))?;
    let mut lines: Vec<&str> = content.lines().collect();
    if !lines.iter().any(|l| l.trim() == source_line) {
        // The last line closes the misc menu.
        let at = lines.len().saturating_sub(1);
        lines.insert(at, source_line.as_str());
        let mut updated = lines.join("\n");
        updated.push('\n');
        fs::write(&kconfig_path, updated)
            .with_context(|| format!("writing '{}'", kconfig_path.display()))?;
    }

    tracing::debug!("added module {} to the kernel", name);
    Ok(name)
}

/// `CONFIG_` symbol of the first `config` entry, e.g. `config like_mod`
/// gives `CONFIG_LIKE_MOD`.
fn config_symbol(kconfig: &str) -> Option<String> {
    let line = kconfig
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("config "))?;
    let words: Vec<String> = line.split_whitespace().map(str::to_uppercase).collect();
    Some(words.join("_"))
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("walking '{}'", src.display()))?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("creating '{}'", target.display()))?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "copying '{}' to '{}'",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
    }
    Ok(())
}
