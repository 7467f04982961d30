use colored::Colorize;
use kegger::error::{KegError, Result};
use kegger::installer::{InstallOutcome, InstallReport, Installer};
use kegger::manifest::{ArchiveKind, PackageManifest};
use kegger::platform::{Arch, Os, Platform};
use kegger::release::{AssetFilter, Release, ReleaseClient, manifest_from_release};
use kegger::symlink::LinkKind;
use std::path::{Path, PathBuf};

pub async fn install(installer: &Installer, manifests: &[PathBuf], platform: &Platform) -> Result<()> {
    let manifests = manifests
        .iter()
        .map(|path| PackageManifest::from_path(path))
        .collect::<Result<Vec<_>>>()?;

    let names: Vec<String> = manifests.iter().map(PackageManifest::id).collect();
    println!(
        "{} Installing {} for {}",
        "==>".bold().green(),
        names.join(", ").bold(),
        platform.to_string().cyan()
    );

    for report in installer.install_many(&manifests, platform).await? {
        print_install(&report);
    }
    Ok(())
}

fn print_install(report: &InstallReport) {
    let mark = match report.outcome {
        InstallOutcome::AlreadyInstalled => "•".dimmed(),
        _ => "✓".green(),
    };
    println!(
        "  {} {} {} {}",
        mark,
        report.name.bold(),
        report.version.cyan(),
        format!("({}, {}ms)", report.outcome, report.time_ms).dimmed()
    );
    for link in &report.links {
        let how = match &link.kind {
            LinkKind::Symlink { target } => format!("-> {}", target.display()),
            LinkKind::Launcher { .. } => "(launcher)".to_string(),
        };
        println!("    {} {}", link.path.display(), how.dimmed());
    }
}

pub async fn uninstall(installer: &Installer, names: &[String], force: bool) -> Result<()> {
    for name in names {
        let report = installer.uninstall(name, force).await?;
        println!(
            "{} Uninstalled {} {}",
            "✓".green(),
            report.name.bold(),
            report.versions.join(", ").cyan()
        );
        for path in &report.unlinked {
            println!("    {} {}", "unlinked".dimmed(), path.display());
        }
    }
    Ok(())
}

pub async fn activate(installer: &Installer, name: &str, version: &str) -> Result<()> {
    let links = installer.activate(name, version).await?;
    println!(
        "{} Activated {} {} ({} commands)",
        "✓".green(),
        name.bold(),
        version.cyan(),
        links.len()
    );
    Ok(())
}

pub fn list(installer: &Installer, versions: bool) -> Result<()> {
    let packages = installer.list()?;
    if packages.is_empty() {
        println!("{}", "No packages installed".dimmed());
        return Ok(());
    }

    for pkg in packages {
        let active = pkg.active.as_deref().unwrap_or("-");
        if versions {
            let listed: Vec<String> = pkg
                .versions
                .iter()
                .map(|v| {
                    if Some(v.as_str()) == pkg.active.as_deref() {
                        format!("{}*", v).green().to_string()
                    } else {
                        v.clone()
                    }
                })
                .collect();
            println!("{} {}", pkg.name.bold(), listed.join(" "));
        } else {
            println!("{} {}", pkg.name.bold(), active.cyan());
        }
    }
    Ok(())
}

pub async fn cleanup(installer: &Installer, name: Option<&str>) -> Result<()> {
    let report = installer.cleanup(name).await?;

    for keg in &report.removed {
        println!("{} Removed {}", "✓".green(), keg);
    }
    for keg in &report.pinned {
        println!("{} Kept {} {}", "•".dimmed(), keg, "(still used by other packages)".dimmed());
    }
    for (keg, error) in &report.errors {
        eprintln!("{} {}: {}", "✗".red(), keg, error);
    }
    if report.removed.is_empty() {
        println!("{}", "Nothing to clean up".dimmed());
    } else {
        println!(
            "{} Freed {:.1} MB",
            "==>".bold().green(),
            report.bytes_freed as f64 / (1024.0 * 1024.0)
        );
    }
    Ok(())
}

pub async fn test(installer: &Installer, name: &str) -> Result<()> {
    let report = installer.test(name).await?;
    print!("{}", report.stdout);
    eprint!("{}", report.stderr);

    if report.success {
        println!(
            "{} {} {}: {} passed",
            "✓".green(),
            report.name.bold(),
            report.version.cyan(),
            report.command
        );
        Ok(())
    } else {
        Err(KegError::Other(anyhow::anyhow!(
            "{} {}: `{}` failed with exit code {}",
            report.name,
            report.version,
            report.command,
            report
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none (killed by signal)".into())
        )))
    }
}

pub struct GenerateArgs<'a> {
    pub template: &'a Path,
    pub repo: &'a str,
    pub release_file: Option<&'a Path>,
    pub output: Option<&'a Path>,
    pub os: Os,
    pub arches: Vec<Arch>,
    pub archive: ArchiveKind,
}

pub async fn generate(args: GenerateArgs<'_>) -> Result<()> {
    let template = PackageManifest::from_path(args.template)?;

    let release = match args.release_file {
        Some(path) => Release::from_json(&std::fs::read_to_string(path)?)?,
        None => ReleaseClient::new()?.latest(args.repo).await?,
    };

    let filter = AssetFilter {
        os: args.os,
        arches: args.arches,
        archive: args.archive,
    };
    let manifest = manifest_from_release(&template, &release, &filter)?;
    let json = manifest.to_json()?;

    match args.output {
        Some(path) => {
            std::fs::write(path, format!("{}\n", json))?;
            eprintln!(
                "{} Wrote {} {} to {}",
                "✓".green(),
                manifest.name.bold(),
                manifest.version.cyan(),
                path.display()
            );
        }
        None => println!("{}", json),
    }
    Ok(())
}
