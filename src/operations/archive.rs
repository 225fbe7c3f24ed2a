//! Archive operation engine: drives external archivers (tar and friends,
//! zip, 7z, unrar) through the exec channel, estimating progress from their
//! line-oriented output.

use std::fmt;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::operations::operation::Outcome;
use crate::operations::scheduler::OpContext;
use crate::operations::shell_escape;
use crate::remote::{ExecChannel, SpawnOptions};

/// Supported archive formats. Rar is extraction-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarBz2,
    TarXz,
    Zip,
    SevenZ,
    Rar,
}

/// Extension table, longest suffixes first so `.tar.gz` wins over `.tar`.
const FORMAT_MAP: &[(&[&str], ArchiveFormat)] = &[
    (&[".tar.gz", ".tgz"], ArchiveFormat::TarGz),
    (&[".tar.bz2", ".tbz2"], ArchiveFormat::TarBz2),
    (&[".tar.xz", ".txz"], ArchiveFormat::TarXz),
    (&[".tar"], ArchiveFormat::Tar),
    (&[".zip"], ArchiveFormat::Zip),
    (&[".7z"], ArchiveFormat::SevenZ),
    (&[".rar"], ArchiveFormat::Rar),
];

impl ArchiveFormat {
    /// Derive the format from a file name, case-insensitively.
    pub fn detect(filename: &str) -> Option<Self> {
        let lower = filename.to_lowercase();
        for (exts, format) in FORMAT_MAP {
            if exts.iter().any(|ext| lower.ends_with(ext)) {
                return Some(*format);
            }
        }
        None
    }

    /// Canonical file extension for the format, dot included.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Tar => ".tar",
            Self::TarGz => ".tar.gz",
            Self::TarBz2 => ".tar.bz2",
            Self::TarXz => ".tar.xz",
            Self::Zip => ".zip",
            Self::SevenZ => ".7z",
            Self::Rar => ".rar",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
            Self::TarBz2 => "tar.bz2",
            Self::TarXz => "tar.xz",
            Self::Zip => "zip",
            Self::SevenZ => "7z",
            Self::Rar => "rar",
        }
    }

    fn is_tar(&self) -> bool {
        matches!(self, Self::Tar | Self::TarGz | Self::TarBz2 | Self::TarXz)
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which external archivers the remote side has. Probed once per engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct AvailableTools {
    pub tar: bool,
    pub zip: bool,
    pub unzip: bool,
    pub p7zip: bool,
    pub unrar: bool,
}

pub(crate) struct ArchiveEngine {
    channel: Arc<dyn ExecChannel>,
    opts: SpawnOptions,
    tools: OnceCell<AvailableTools>,
}

impl ArchiveEngine {
    pub fn new(channel: Arc<dyn ExecChannel>, opts: SpawnOptions) -> Self {
        Self {
            channel,
            opts,
            tools: OnceCell::new(),
        }
    }

    /// Probe for external tools, cached for the lifetime of the engine.
    pub async fn detect_tools(&self) -> AvailableTools {
        *self
            .tools
            .get_or_init(|| async {
                let check = |cmd: &'static str| async move {
                    self.channel
                        .run(&vec!["which".into(), cmd.into()], &self.opts, None)
                        .await
                        .is_ok()
                };
                let (tar, zip, unzip, p7zip, unrar) =
                    tokio::join!(check("tar"), check("zip"), check("unzip"), check("7z"), check("unrar"));
                let tools = AvailableTools {
                    tar,
                    zip,
                    unzip,
                    p7zip,
                    unrar,
                };
                info!(?tools, "archive tool probe");
                tools
            })
            .await
    }

    /// Formats offered for compression, restricted by tool availability.
    pub async fn compress_formats(&self) -> Vec<ArchiveFormat> {
        let tools = self.detect_tools().await;
        let mut formats = Vec::new();
        if tools.tar {
            formats.extend([
                ArchiveFormat::Tar,
                ArchiveFormat::TarGz,
                ArchiveFormat::TarBz2,
                ArchiveFormat::TarXz,
            ]);
        }
        if tools.zip {
            formats.push(ArchiveFormat::Zip);
        }
        if tools.p7zip {
            formats.push(ArchiveFormat::SevenZ);
        }
        formats
    }

    /// Whether `filename` can be extracted, based on its extension and the
    /// available tools.
    pub async fn can_extract(&self, filename: &str) -> bool {
        let Some(format) = ArchiveFormat::detect(filename) else {
            return false;
        };
        let tools = self.detect_tools().await;
        if format.is_tar() {
            return tools.tar;
        }
        match format {
            ArchiveFormat::Zip => tools.unzip,
            ArchiveFormat::SevenZ => tools.p7zip,
            ArchiveFormat::Rar => tools.unrar,
            _ => false,
        }
    }

    pub async fn compress(
        &self,
        paths: &[String],
        format: ArchiveFormat,
        output_path: &str,
        parent_dir: &str,
        ctx: &OpContext,
    ) -> Result<Outcome> {
        let names: Vec<&str> = paths.iter().filter_map(|p| last_segment(p)).collect();

        let total = self
            .count_or_one(compress_count_argv(parent_dir, &names))
            .await;
        ctx.set_total_units(total);

        let argv = compress_argv(format, output_path, parent_dir, &names, paths)?;
        self.run_with_progress(&argv, ctx).await
    }

    pub async fn extract(
        &self,
        archive_path: &str,
        dest_dir: &str,
        ctx: &OpContext,
    ) -> Result<Outcome> {
        let filename = last_segment(archive_path).unwrap_or_default();
        let format = ArchiveFormat::detect(filename).ok_or_else(|| Error::UnknownFormat {
            name: filename.to_string(),
        })?;

        let total = self
            .count_or_one(extract_count_argv(format, archive_path))
            .await;
        ctx.set_total_units(total);

        let argv = extract_argv(format, archive_path, dest_dir);
        self.run_with_progress(&argv, ctx).await
    }

    /// Pre-flight item count. Any failure degrades progress to coarse binary
    /// display instead of failing the operation.
    async fn count_or_one(&self, argv: Vec<String>) -> u64 {
        match self.channel.run(&argv, &self.opts, None).await {
            Ok(out) => {
                let n = out.trim().parse::<u64>().unwrap_or(0);
                if n == 0 {
                    1
                } else {
                    n
                }
            }
            Err(e) => {
                debug!(error = %e, "item count estimation failed, defaulting to 1");
                1
            }
        }
    }

    /// Run the archiver, treating each non-empty output line as one processed
    /// item. Cancellation is checked on every line; the child is terminated
    /// best-effort and a termination error still reports `Cancelled`.
    async fn run_with_progress(&self, argv: &[String], ctx: &OpContext) -> Result<Outcome> {
        if ctx.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        let mut proc = self.channel.spawn_stream(argv, &self.opts).await?;
        let mut lines = 0u64;

        loop {
            match proc.next_line().await {
                Ok(Some(line)) => {
                    if ctx.is_cancelled() {
                        if let Err(e) = proc.terminate().await {
                            debug!(error = %e, "failed to terminate archiver");
                        }
                        return Ok(Outcome::Cancelled);
                    }
                    if !line.trim().is_empty() {
                        lines += 1;
                        ctx.advance_items(lines);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    if ctx.is_cancelled() {
                        return Ok(Outcome::Cancelled);
                    }
                    return Err(e);
                }
            }
        }

        match proc.wait().await {
            Ok(()) => {
                // Process confirmed done: snap to the full item count.
                ctx.finish_items();
                Ok(Outcome::Completed)
            }
            Err(_) if ctx.is_cancelled() => Ok(Outcome::Cancelled),
            Err(e) => Err(e),
        }
    }
}

fn last_segment(path: &str) -> Option<&str> {
    path.rsplit('/').next().filter(|s| !s.is_empty())
}

fn bash(script: String) -> Vec<String> {
    vec!["bash".into(), "-c".into(), script]
}

/// `find <names> -type f | wc -l` inside the working directory.
fn compress_count_argv(parent_dir: &str, names: &[&str]) -> Vec<String> {
    let escaped: Vec<String> = names.iter().map(|n| shell_escape(n)).collect();
    bash(format!(
        "cd {} && find {} -type f 2>/dev/null | wc -l",
        shell_escape(parent_dir),
        escaped.join(" ")
    ))
}

fn compress_argv(
    format: ArchiveFormat,
    output_path: &str,
    parent_dir: &str,
    names: &[&str],
    paths: &[String],
) -> Result<Vec<String>> {
    let argv = match format {
        ArchiveFormat::Tar => tar_create("cvf", output_path, parent_dir, names),
        ArchiveFormat::TarGz => tar_create("czvf", output_path, parent_dir, names),
        ArchiveFormat::TarBz2 => tar_create("cjvf", output_path, parent_dir, names),
        ArchiveFormat::TarXz => tar_create("cJvf", output_path, parent_dir, names),
        ArchiveFormat::Zip => {
            let escaped: Vec<String> = names.iter().map(|n| shell_escape(n)).collect();
            bash(format!(
                "cd {} && zip -rv {} {}",
                shell_escape(parent_dir),
                shell_escape(output_path),
                escaped.join(" ")
            ))
        }
        ArchiveFormat::SevenZ => {
            let mut argv: Vec<String> = vec!["7z".into(), "a".into(), output_path.into()];
            argv.extend(paths.iter().cloned());
            argv
        }
        ArchiveFormat::Rar => return Err(Error::UnsupportedFormat { format }),
    };
    Ok(argv)
}

fn tar_create(flags: &str, output_path: &str, parent_dir: &str, names: &[&str]) -> Vec<String> {
    let mut argv: Vec<String> = vec![
        "tar".into(),
        flags.into(),
        output_path.into(),
        "-C".into(),
        parent_dir.into(),
    ];
    argv.extend(names.iter().map(|n| n.to_string()));
    argv
}

fn extract_count_argv(format: ArchiveFormat, archive_path: &str) -> Vec<String> {
    let archive = shell_escape(archive_path);
    if format.is_tar() {
        return bash(format!("tar tf {archive} | wc -l"));
    }
    match format {
        ArchiveFormat::Zip => bash(format!("unzip -l {archive} | tail -1 | awk '{{print $2}}'")),
        ArchiveFormat::SevenZ => bash(format!("7z l {archive} | grep -c \"^[0-9]\" || echo 1")),
        ArchiveFormat::Rar => bash(format!("unrar l {archive} | grep -c \"^[. ]\" || echo 1")),
        _ => vec!["echo".into(), "1".into()],
    }
}

fn extract_argv(format: ArchiveFormat, archive_path: &str, dest_dir: &str) -> Vec<String> {
    if format.is_tar() {
        return vec![
            "tar".into(),
            "xvf".into(),
            archive_path.into(),
            "-C".into(),
            dest_dir.into(),
        ];
    }
    match format {
        ArchiveFormat::SevenZ => vec![
            "7z".into(),
            "x".into(),
            archive_path.into(),
            format!("-o{dest_dir}"),
            "-y".into(),
        ],
        ArchiveFormat::Rar => vec![
            "unrar".into(),
            "x".into(),
            "-o+".into(),
            archive_path.into(),
            format!("{dest_dir}/"),
        ],
        // Tar variants returned above; only zip remains.
        _ => vec![
            "unzip".into(),
            "-o".into(),
            archive_path.into(),
            "-d".into(),
            dest_dir.into(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::remote::ProcessStream;

    #[test]
    fn detect_prefers_longest_suffix() {
        assert_eq!(ArchiveFormat::detect("a.tar.gz"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect("a.tgz"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect("a.tar.bz2"), Some(ArchiveFormat::TarBz2));
        assert_eq!(ArchiveFormat::detect("a.tar.xz"), Some(ArchiveFormat::TarXz));
        assert_eq!(ArchiveFormat::detect("a.tar"), Some(ArchiveFormat::Tar));
        assert_eq!(ArchiveFormat::detect("A.ZIP"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::detect("a.7z"), Some(ArchiveFormat::SevenZ));
        assert_eq!(ArchiveFormat::detect("a.rar"), Some(ArchiveFormat::Rar));
        assert_eq!(ArchiveFormat::detect("notes.txt"), None);
    }

    #[test]
    fn extension_round_trips_through_detect() {
        for format in [
            ArchiveFormat::Tar,
            ArchiveFormat::TarGz,
            ArchiveFormat::TarBz2,
            ArchiveFormat::TarXz,
            ArchiveFormat::Zip,
            ArchiveFormat::SevenZ,
            ArchiveFormat::Rar,
        ] {
            let name = format!("archive{}", format.extension());
            assert_eq!(ArchiveFormat::detect(&name), Some(format));
        }
    }

    #[test]
    fn tar_compress_command_shape() {
        let argv = compress_argv(
            ArchiveFormat::TarGz,
            "/srv/out.tar.gz",
            "/srv",
            &["docs", "img"],
            &["/srv/docs".into(), "/srv/img".into()],
        )
        .unwrap();
        assert_eq!(
            argv,
            vec!["tar", "czvf", "/srv/out.tar.gz", "-C", "/srv", "docs", "img"]
        );
    }

    #[test]
    fn zip_compress_runs_in_parent_dir() {
        let argv = compress_argv(
            ArchiveFormat::Zip,
            "/srv/out.zip",
            "/srv",
            &["docs"],
            &["/srv/docs".into()],
        )
        .unwrap();
        assert_eq!(argv[0], "bash");
        assert_eq!(argv[2], "cd '/srv' && zip -rv '/srv/out.zip' 'docs'");
    }

    #[test]
    fn seven_z_compress_uses_full_paths() {
        let argv = compress_argv(
            ArchiveFormat::SevenZ,
            "/srv/out.7z",
            "/srv",
            &["docs"],
            &["/srv/docs".into()],
        )
        .unwrap();
        assert_eq!(argv, vec!["7z", "a", "/srv/out.7z", "/srv/docs"]);
    }

    #[test]
    fn rar_compression_is_unsupported() {
        let err = compress_argv(ArchiveFormat::Rar, "/srv/out.rar", "/srv", &[], &[]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat { .. }));
    }

    #[test]
    fn extract_commands_per_format() {
        assert_eq!(
            extract_argv(ArchiveFormat::Tar, "/srv/a.tar", "/dst"),
            vec!["tar", "xvf", "/srv/a.tar", "-C", "/dst"]
        );
        assert_eq!(
            extract_argv(ArchiveFormat::Zip, "/srv/a.zip", "/dst"),
            vec!["unzip", "-o", "/srv/a.zip", "-d", "/dst"]
        );
        assert_eq!(
            extract_argv(ArchiveFormat::SevenZ, "/srv/a.7z", "/dst"),
            vec!["7z", "x", "/srv/a.7z", "-o/dst", "-y"]
        );
        assert_eq!(
            extract_argv(ArchiveFormat::Rar, "/srv/a.rar", "/dst"),
            vec!["unrar", "x", "-o+", "/srv/a.rar", "/dst/"]
        );
    }

    #[test]
    fn compress_count_pipeline() {
        let argv = compress_count_argv("/srv", &["docs", "img"]);
        assert_eq!(argv[2], "cd '/srv' && find 'docs' 'img' -type f 2>/dev/null | wc -l");
    }

    struct ToolChannel {
        present: &'static [&'static str],
    }

    #[async_trait]
    impl ExecChannel for ToolChannel {
        async fn run(
            &self,
            argv: &[String],
            _opts: &SpawnOptions,
            _stdin: Option<&[u8]>,
        ) -> Result<String> {
            if argv[0] == "which" && self.present.contains(&argv[1].as_str()) {
                Ok(format!("/usr/bin/{}\n", argv[1]))
            } else {
                Err(Error::Transport {
                    message: format!("{} not found", argv[1]),
                })
            }
        }

        async fn spawn_stream(
            &self,
            _argv: &[String],
            _opts: &SpawnOptions,
        ) -> Result<Box<dyn ProcessStream>> {
            Err(Error::Spawn {
                message: "not supported in this test".into(),
            })
        }
    }

    fn engine(present: &'static [&'static str]) -> ArchiveEngine {
        ArchiveEngine::new(Arc::new(ToolChannel { present }), SpawnOptions::default())
    }

    #[tokio::test]
    async fn compress_formats_follow_tool_availability() {
        let formats = engine(&["tar", "zip"]).compress_formats().await;
        assert_eq!(
            formats,
            vec![
                ArchiveFormat::Tar,
                ArchiveFormat::TarGz,
                ArchiveFormat::TarBz2,
                ArchiveFormat::TarXz,
                ArchiveFormat::Zip,
            ]
        );

        let formats = engine(&["7z"]).compress_formats().await;
        assert_eq!(formats, vec![ArchiveFormat::SevenZ]);
    }

    #[tokio::test]
    async fn can_extract_matches_tooling_and_extension() {
        let e = engine(&["tar", "unrar"]);
        assert!(e.can_extract("bundle.tar.xz").await);
        assert!(e.can_extract("old.rar").await);
        assert!(!e.can_extract("pack.zip").await);
        assert!(!e.can_extract("notes.txt").await);
    }

    #[tokio::test]
    async fn estimation_failure_falls_back_to_one() {
        let e = engine(&[]);
        // ToolChannel rejects everything that is not a known `which`.
        let total = e.count_or_one(vec!["bash".into(), "-c".into(), "whatever".into()]).await;
        assert_eq!(total, 1);
    }
}
