//! Main config parsing and rendering: `menuentry "T" { ... }` blocks,
//! each possibly containing nested `submenuentry "T" { ... }` blocks,
//! `include <path>` directives, and directive lines outside any block
//! ("global" text) preserved verbatim.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// One top-level `menuentry` block as found in an existing config
/// file. `attribute_lines` holds every directive line the user wrote
/// directly inside the block (icon/volume/loader/initrd/options/
/// disabled), in original order and original text — this is what the
/// generator preserves untouched. Any `submenuentry` sub-blocks found
/// while parsing are discarded; the generator always regenerates them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MenuEntryBlock {
    pub title: String,
    pub attribute_lines: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct MainConfig {
    /// Lines that precede the first `menuentry` block, or otherwise
    /// fall outside any block (e.g. `include <path>` directives).
    pub global_lines: Vec<String>,
    pub entries: Vec<MenuEntryBlock>,
}

fn parse_title(line: &str, keyword: &str) -> Option<String> {
    let rest = line.trim().strip_prefix(keyword)?.trim();
    let rest = rest.strip_suffix('{')?.trim();
    let rest = rest.strip_prefix('"')?;
    let rest = rest.strip_suffix('"')?;
    Some(rest.to_string())
}

impl MainConfig {
    pub fn parse(text: &str) -> Result<Self> {
        let mut config = MainConfig::default();
        let mut lines = text.lines().peekable();

        while let Some(line) = lines.next() {
            let trimmed = line.trim();
            if let Some(title) = parse_title(trimmed, "menuentry") {
                let mut attribute_lines = Vec::new();
                loop {
                    let inner = lines.next().with_context(|| format!("unterminated menuentry {title:?}"))?;
                    let inner_trimmed = inner.trim();
                    if inner_trimmed == "}" {
                        break;
                    }
                    if parse_title(inner_trimmed, "submenuentry").is_some() {
                        // Discard the nested block; skip to its closing brace.
                        let mut depth = 1;
                        for nested in lines.by_ref() {
                            let nested_trimmed = nested.trim();
                            if nested_trimmed.ends_with('{') {
                                depth += 1;
                            } else if nested_trimmed == "}" {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                        }
                        continue;
                    }
                    if !inner_trimmed.is_empty() {
                        attribute_lines.push(inner_trimmed.to_string());
                    }
                }
                config.entries.push(MenuEntryBlock { title, attribute_lines });
            } else {
                config.global_lines.push(line.to_string());
            }
        }
        Ok(config)
    }
}

/// A freshly-generated submenu, one per snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedSubmenu {
    pub title: String,
    pub options: String,
}

/// Render one top-level menuentry block plus its freshly-generated
/// submenus, 4-space indented, LF line endings.
pub fn render_menu_entry(entry: &MenuEntryBlock, submenus: &[RenderedSubmenu]) -> String {
    let mut out = format!("menuentry \"{}\" {{\n", entry.title);
    for line in &entry.attribute_lines {
        out.push_str("    ");
        out.push_str(line);
        out.push('\n');
    }
    for submenu in submenus {
        out.push_str("    submenuentry \"");
        out.push_str(&submenu.title);
        out.push_str("\" {\n");
        out.push_str("        options \"");
        out.push_str(&submenu.options);
        out.push_str("\"\n    }\n");
    }
    out.push_str("}\n");
    out
}

/// Resolve `include <path>` directives found in `config.global_lines`,
/// relative to `base_dir` (the directory containing the file `config`
/// was parsed from). One level deep only — an included file's own
/// `include` lines are left as opaque text, which keeps discovery
/// bounded without needing cycle detection. A missing or unreadable
/// include is logged and skipped, not an error.
pub fn resolve_includes(base_dir: &Path, config: &MainConfig) -> Vec<(PathBuf, String, MainConfig)> {
    let mut out = Vec::new();
    for line in &config.global_lines {
        let Some(rest) = line.trim().strip_prefix("include") else { continue };
        let rest = rest.trim();
        if rest.is_empty() {
            continue;
        }
        let include_path = base_dir.join(rest);
        let text = match std::fs::read_to_string(&include_path) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("failed to read included config {}: {e:#}", include_path.display());
                continue;
            }
        };
        match MainConfig::parse(&text) {
            Ok(included) => out.push((include_path, text, included)),
            Err(e) => log::warn!("failed to parse included config {}: {e:#}", include_path.display()),
        }
    }
    out
}

/// The inert template emitted the first time a managed main-config
/// file doesn't exist yet: a single disabled menuentry plus an
/// explanatory comment. Invariant: stays inert until a human removes
/// the `disabled` line.
pub fn render_template(title: &str) -> String {
    format!(
        "# Generated by rbgen. Remove the \"disabled\" line below to enable\n\
         # this menu entry once you have reviewed and adjusted it.\n\
         menuentry \"{title}\" {{\n    disabled\n}}\n"
    )
}
