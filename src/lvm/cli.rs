//! LVM command line engine
//!
//! Drives `pvcreate`/`vgcreate`/`lvcreate` and friends and parses the JSON
//! reports of `pvs`/`vgs`/`lvs`. Sizes cross the boundary as byte counts with
//! an explicit `B` suffix. Every child process is killed when its future is
//! dropped, so cancelling a caller terminates the running tool.

use super::error::{LvmError, LvmResult};
use super::types::*;
use crate::domain::ports::LvmManager;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the LVM engine
#[derive(Debug, Clone)]
pub struct LvmConfig {
    /// Directories searched for the reporting tools
    pub bin_dirs: Vec<PathBuf>,
    /// Wait between attempts when a volume is still open
    pub remove_retry_interval: Duration,
    /// Give up removing an open volume after this long
    pub remove_retry_timeout: Duration,
}

impl Default for LvmConfig {
    fn default() -> Self {
        Self {
            bin_dirs: vec![PathBuf::from("/sbin"), PathBuf::from("/usr/sbin")],
            remove_retry_interval: Duration::from_millis(500),
            remove_retry_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Report parsing
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawPv {
    pv_name: String,
    #[serde(default)]
    vg_name: String,
    #[serde(default)]
    pv_size: String,
    #[serde(default)]
    pv_free: String,
}

#[derive(Debug, Deserialize)]
struct RawVg {
    vg_name: String,
    #[serde(default)]
    vg_uuid: String,
    #[serde(default)]
    vg_size: String,
    #[serde(default)]
    vg_free: String,
    #[serde(default)]
    vg_extent_size: String,
    #[serde(default)]
    pv_count: String,
    #[serde(default)]
    lv_count: String,
    #[serde(default)]
    vg_tags: String,
}

#[derive(Debug, Deserialize)]
struct RawLv {
    lv_name: String,
    vg_name: String,
    #[serde(default)]
    lv_path: String,
    #[serde(default)]
    lv_size: String,
    #[serde(default)]
    lv_attr: String,
}

/// Parse a `<n>B` size field; empty fields read as zero
pub(crate) fn parse_size(field: &str) -> LvmResult<u64> {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed
        .trim_end_matches(['B', 'b'])
        .parse()
        .map_err(|_| LvmError::Other {
            command: "report".into(),
            message: format!("invalid size {}", field),
        })
}

fn parse_count(field: &str) -> LvmResult<u32> {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed.parse().map_err(|_| LvmError::Other {
        command: "report".into(),
        message: format!("invalid count {}", field),
    })
}

/// Extract the rows under `key` from an LVM `--reportformat json` document
pub(crate) fn parse_report<T: DeserializeOwned>(output: &[u8], key: &str) -> LvmResult<Vec<T>> {
    let invalid = |e: String| LvmError::Other {
        command: "report".into(),
        message: format!("failed to parse report: {}", e),
    };

    let doc: serde_json::Value = serde_json::from_slice(output).map_err(|e| invalid(e.to_string()))?;
    let mut rows = Vec::new();
    for section in doc["report"].as_array().into_iter().flatten() {
        if let Some(entries) = section.get(key) {
            let parsed: Vec<T> =
                serde_json::from_value(entries.clone()).map_err(|e| invalid(e.to_string()))?;
            rows.extend(parsed);
        }
    }
    Ok(rows)
}

fn into_pv(raw: RawPv) -> LvmResult<PhysicalVolume> {
    Ok(PhysicalVolume {
        size: parse_size(&raw.pv_size)?,
        free: parse_size(&raw.pv_free)?,
        name: raw.pv_name,
        vg_name: raw.vg_name,
    })
}

fn into_vg(raw: RawVg) -> LvmResult<VolumeGroup> {
    Ok(VolumeGroup {
        size: parse_size(&raw.vg_size)?,
        free: parse_size(&raw.vg_free)?,
        extent_size: parse_size(&raw.vg_extent_size)?,
        pv_count: parse_count(&raw.pv_count)?,
        lv_count: parse_count(&raw.lv_count)?,
        tags: raw
            .vg_tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect(),
        name: raw.vg_name,
        uuid: raw.vg_uuid,
    })
}

fn into_lv(raw: RawLv) -> LvmResult<LogicalVolume> {
    Ok(LogicalVolume {
        size: parse_size(&raw.lv_size)?,
        path: if raw.lv_path.is_empty() {
            format!("/dev/{}/{}", raw.vg_name, raw.lv_name)
        } else {
            raw.lv_path
        },
        name: raw.lv_name,
        vg_name: raw.vg_name,
        attr: raw.lv_attr,
    })
}

// =============================================================================
// LVM CLI Engine
// =============================================================================

/// [`LvmManager`] backed by the LVM2 command line tools
#[derive(Debug, Clone, Default)]
pub struct LvmCli {
    config: LvmConfig,
}

impl LvmCli {
    pub fn new(config: LvmConfig) -> Self {
        Self { config }
    }

    async fn run(&self, command: &str, args: &[String]) -> LvmResult<Vec<u8>> {
        debug!("Running {} {}", command, args.join(" "));
        let output = Command::new(command)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| LvmError::Other {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(LvmError::from_stderr(
                command,
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    async fn report<T: DeserializeOwned>(
        &self,
        command: &str,
        key: &str,
        fields: &str,
        select: Option<String>,
    ) -> LvmResult<Vec<T>> {
        let mut args: Vec<String> = ["--reportformat", "json", "--units", "B", "-o", fields]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(select) = select {
            args.push("-S".into());
            args.push(select);
        }
        let stdout = self.run(command, &args).await?;
        parse_report(&stdout, key)
    }
}

const PV_FIELDS: &str = "pv_name,vg_name,pv_size,pv_free";
const VG_FIELDS: &str = "vg_name,vg_uuid,vg_size,vg_free,vg_extent_size,pv_count,lv_count,vg_tags";
const LV_FIELDS: &str = "lv_name,vg_name,lv_path,lv_size,lv_attr";

#[async_trait]
impl LvmManager for LvmCli {
    async fn create_physical_volume(&self, opts: &CreatePvOptions) -> LvmResult<()> {
        self.run("pvcreate", &[opts.name.clone()]).await?;
        info!("Created physical volume {}", opts.name);
        Ok(())
    }

    async fn remove_physical_volume(&self, name: &str) -> LvmResult<()> {
        self.run("pvremove", &["--yes".into(), name.into()]).await?;
        info!("Removed physical volume {}", name);
        Ok(())
    }

    async fn list_physical_volumes(
        &self,
        select: Option<&Selector>,
    ) -> LvmResult<Vec<PhysicalVolume>> {
        let raw: Vec<RawPv> = self
            .report("pvs", "pv", PV_FIELDS, select.map(Selector::to_lvm_select))
            .await?;
        raw.into_iter().map(into_pv).collect()
    }

    async fn create_volume_group(&self, opts: &CreateVgOptions) -> LvmResult<()> {
        let mut args = vec![
            "--physicalextentsize".to_string(),
            format!("{}B", EXTENT_SIZE),
        ];
        for tag in &opts.tags {
            args.push("--addtag".into());
            args.push(tag.clone());
        }
        args.push(opts.name.clone());
        args.extend(opts.pv_names.iter().cloned());

        self.run("vgcreate", &args).await?;
        info!(
            "Created volume group {} on {} physical volumes",
            opts.name,
            opts.pv_names.len()
        );
        Ok(())
    }

    async fn remove_volume_group(&self, name: &str) -> LvmResult<()> {
        self.run("vgremove", &["--force".into(), "--yes".into(), name.into()])
            .await?;
        info!("Removed volume group {}", name);
        Ok(())
    }

    async fn get_volume_group(&self, name: &str) -> LvmResult<VolumeGroup> {
        self.list_volume_groups(Some(&Selector::VgName(name.to_string())))
            .await?
            .into_iter()
            .find(|vg| vg.name == name)
            .ok_or_else(|| LvmError::NotFound(format!("volume group {}", name)))
    }

    async fn list_volume_groups(&self, select: Option<&Selector>) -> LvmResult<Vec<VolumeGroup>> {
        let raw: Vec<RawVg> = self
            .report("vgs", "vg", VG_FIELDS, select.map(Selector::to_lvm_select))
            .await?;
        raw.into_iter().map(into_vg).collect()
    }

    async fn create_logical_volume(&self, opts: &CreateLvOptions) -> LvmResult<LogicalVolume> {
        let size = round_up_to_extent(opts.size_bytes);
        let mut args = vec![
            "--name".to_string(),
            opts.name.clone(),
            "--size".to_string(),
            format!("{}B", size),
            "--yes".to_string(),
            "--wipesignatures".to_string(),
            "y".to_string(),
            "--zero".to_string(),
            "y".to_string(),
        ];
        if let LvLayout::Striped { stripes } = opts.layout {
            args.extend([
                "--type".to_string(),
                "raid0".to_string(),
                "--stripes".to_string(),
                stripes.to_string(),
            ]);
        }
        args.push(opts.vg_name.clone());

        self.run("lvcreate", &args).await?;
        info!(
            "Created logical volume {}/{} ({} bytes, {})",
            opts.vg_name, opts.name, size, opts.layout
        );
        self.get_logical_volume(&opts.vg_name, &opts.name).await
    }

    async fn extend_logical_volume(&self, vg: &str, name: &str, size_bytes: u64) -> LvmResult<u64> {
        let current = self.get_logical_volume(vg, name).await?;
        let size = round_up_to_extent(size_bytes);
        if current.size >= size {
            debug!("Logical volume {}/{} already {} bytes", vg, name, current.size);
            return Ok(current.size);
        }

        self.run(
            "lvextend",
            &["--size".into(), format!("{}B", size), format!("{}/{}", vg, name)],
        )
        .await?;
        let extended = self.get_logical_volume(vg, name).await?;
        info!("Extended logical volume {}/{} to {} bytes", vg, name, extended.size);
        Ok(extended.size)
    }

    async fn remove_logical_volume(&self, vg: &str, name: &str) -> LvmResult<()> {
        let target = format!("{}/{}", vg, name);
        let deadline = Instant::now() + self.config.remove_retry_timeout;
        loop {
            match self.run("lvremove", &["--yes".into(), target.clone()]).await {
                Ok(_) => {
                    info!("Removed logical volume {}", target);
                    return Ok(());
                }
                Err(e) if e.is_device_busy() && Instant::now() < deadline => {
                    warn!("Logical volume {} busy, retrying: {}", target, e);
                    tokio::time::sleep(self.config.remove_retry_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_logical_volume(&self, vg: &str, name: &str) -> LvmResult<LogicalVolume> {
        let raw: Vec<RawLv> = self
            .report(
                "lvs",
                "lv",
                LV_FIELDS,
                Some(format!("vg_name={}&&lv_name={}", vg, name)),
            )
            .await?;
        raw.into_iter()
            .map(into_lv)
            .collect::<LvmResult<Vec<_>>>()?
            .into_iter()
            .find(|lv| lv.vg_name == vg && lv.name == name)
            .ok_or_else(|| LvmError::NotFound(format!("logical volume {}/{}", vg, name)))
    }

    async fn list_logical_volumes(
        &self,
        select: Option<&Selector>,
    ) -> LvmResult<Vec<LogicalVolume>> {
        let raw: Vec<RawLv> = self
            .report("lvs", "lv", LV_FIELDS, select.map(Selector::to_lvm_select))
            .await?;
        raw.into_iter().map(into_lv).collect()
    }

    fn is_supported(&self) -> bool {
        ["pvs", "vgs", "lvs"].iter().all(|tool| {
            self.config
                .bin_dirs
                .iter()
                .any(|dir| dir.join(tool).exists())
        })
    }
}
