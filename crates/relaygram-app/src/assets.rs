use include_dir::{include_dir, Dir};

static STATIC_ASSETS: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/static");

const STATIC_EXTENSIONS: &[(&str, &str)] = &[
    ("html", "text/html; charset=utf-8"),
    ("json", "application/json"),
    ("svg", "image/svg+xml"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("ico", "image/x-icon"),
];

/// Content type for paths that belong to the static collaborator, `None` for
/// everything else.
pub fn static_content_type(path: &str) -> Option<&'static str> {
    let (_, ext) = path.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    STATIC_EXTENSIONS
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, content_type)| *content_type)
}

pub fn static_asset(path: &str) -> Option<&'static [u8]> {
    let clean = path.trim_start_matches('/');
    if clean.split('/').any(|part| part == "..") {
        return None;
    }
    STATIC_ASSETS.get_file(clean).map(|file| file.contents())
}
