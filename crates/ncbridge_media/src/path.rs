#![forbid(unsafe_code)]

//! Storage path rendering for bridged media.

use chrono::{DateTime, Datelike, Utc};

/// Substitute `${year}`, `${month}`, `${day}`, `${room}`, `${user}` and `${file}` into `template`.
///
/// Labels must already be sanitized. Substitution is plain text replacement
/// applied in the order above, so a label that itself contains a later
/// placeholder (for example a file named `${file}.txt` inside `${room}`) is
/// substituted again. Unknown placeholders are left as-is.
///
/// The result is normalized and relative (no leading slash).
pub fn render_path_template(
	template: &str,
	room: &str,
	user: &str,
	file: &str,
	event_time: Option<DateTime<Utc>>,
) -> String {
	let at = event_time.unwrap_or_else(Utc::now);
	let year = at.year().to_string();
	let month = format!("{:02}", at.month());
	let day = format!("{:02}", at.day());

	let replacements: [(&str, &str); 6] = [
		("${year}", &year),
		("${month}", &month),
		("${day}", &day),
		("${room}", room),
		("${user}", user),
		("${file}", file),
	];

	let mut rendered = template.to_string();
	for (placeholder, value) in replacements {
		rendered = rendered.replace(placeholder, value);
	}

	normalize_path(&rendered)
}

/// Make a label safe to use as a single path segment.
pub fn sanitize_path_segment(value: &str) -> String {
	let cleaned = value
		.trim()
		.replace('/', "_")
		.replace('\\', "_")
		.replace(':', "_")
		.replace("..", "_");
	if cleaned.is_empty() {
		"unknown".to_string()
	} else {
		cleaned
	}
}

/// Collapse `.`, `..` and repeated separators, returning a relative path.
///
/// `..` never climbs above the root.
pub fn normalize_path(path: &str) -> String {
	let mut segments: Vec<&str> = Vec::new();
	for segment in path.split('/') {
		match segment {
			"" | "." => {}
			".." => {
				segments.pop();
			}
			other => segments.push(other),
		}
	}
	segments.join("/")
}

/// Split into `(dir, base)`; `dir` is empty for a bare file name.
pub fn split_path(path: &str) -> (&str, &str) {
	match path.rsplit_once('/') {
		Some((dir, base)) => (dir, base),
		None => ("", path),
	}
}

/// Extension of the final segment including its dot, or "".
///
/// Matches the usual rule that the extension starts at the last dot,
/// so `.bashrc` has extension `.bashrc` and `archive.tar.gz` has `.gz`.
pub fn extension(base: &str) -> &str {
	match base.rfind('.') {
		Some(idx) => &base[idx..],
		None => "",
	}
}

/// `dir/name.ext` -> (`dir/name_N.ext`, `name_N.ext`).
pub fn add_counter_suffix(path: &str, counter: u32) -> (String, String) {
	let (dir, base) = split_path(path);
	let ext = extension(base);
	let stem = &base[..base.len() - ext.len()];
	let new_base = format!("{stem}_{counter}{ext}");
	if dir.is_empty() {
		(new_base.clone(), new_base)
	} else {
		(format!("{dir}/{new_base}"), new_base)
	}
}

/// Web UI link that opens the containing folder with the file highlighted.
///
/// Returns `None` when no web URL is configured.
pub fn web_link(web_url: &str, path: &str) -> Option<String> {
	let web_url = web_url.trim().trim_end_matches('/');
	if web_url.is_empty() {
		return None;
	}

	let normalized = normalize_path(path);
	let (dir, file) = split_path(&normalized);
	Some(format!(
		"{web_url}/apps/files/?dir={}&scrollto={}",
		urlencoding::encode(&format!("/{dir}")),
		urlencoding::encode(file)
	))
}
