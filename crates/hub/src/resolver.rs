//! Topic-URI resolution.
//!
//! Consumers address topics by short or partial names; the resolver expands
//! them into canonical topic URIs of the form `scheme:/appName/path`. A name
//! that already carries a scheme is returned unchanged, which makes
//! resolution idempotent. Names may reference other topics with `${...}`,
//! whose current cached values are substituted in before resolution.

/// Placeholder replaced by the current app name during resolution.
pub const APP_PLACEHOLDER: &str = "{app}";

/// Hard cap on `${...}` substitutions per resolution. A cyclic reference
/// stops expanding here instead of looping.
pub const MAX_SUBSTITUTIONS: usize = 16;

/// File extensions resolved to the `image:` scheme.
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "bmp"];

/// Maps short topic names to fully qualified topic URIs.
pub struct TopicResolver {
    app_name: String,
}

impl TopicResolver {
    /// Creates a resolver for the given app namespace.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }

    /// Returns the current app name.
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Switches the app namespace used for subsequent resolutions.
    pub fn set_app_name(&mut self, app_name: impl Into<String>) {
        self.app_name = app_name.into();
    }

    /// Extracts the field suffix of a field-qualified topic name, or the
    /// empty string if there is none.
    pub fn field_name(topic: &str) -> &str {
        topic
            .find('#')
            .map(|idx| &topic[idx + 1..])
            .unwrap_or("")
    }

    /// Strips the field suffix of a field-qualified topic name.
    pub fn strip_field(topic: &str) -> &str {
        topic.find('#').map(|idx| &topic[..idx]).unwrap_or(topic)
    }

    /// Resolves a short or partial topic name into its canonical URI.
    ///
    /// Field suffixes address one property of an object-valued topic;
    /// resolution operates on the parent, so any trailing `#field` is
    /// stripped first. `lookup` supplies the current cached value of another
    /// topic for `${...}` substitution.
    pub fn resolve<F>(&self, name: &str, lookup: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        self.resolve_inner(Self::strip_field(name), &lookup)
    }

    fn resolve_inner(&self, name: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
        let mut name = name.replace(APP_PLACEHOLDER, &self.app_name);

        // Each pass consumes the leftmost `${...}` occurrence. A reference
        // may expand to text containing further references, so the count is
        // capped rather than derived from the input.
        let mut substitutions = 0;
        while let Some(start) = name.find("${") {
            let Some(relative_end) = name[start..].find('}') else {
                break;
            };
            if substitutions >= MAX_SUBSTITUTIONS {
                tracing::warn!(
                    topic = %name,
                    cap = MAX_SUBSTITUTIONS,
                    "substitution cap reached while resolving topic"
                );
                break;
            }
            let end = start + relative_end;
            let reference = name[start + 2..end].to_string();
            let resolved_reference = self.resolve_inner(&reference, lookup);
            let value = lookup(&resolved_reference).unwrap_or_default();
            name.replace_range(start..=end, &value);
            substitutions += 1;
        }

        // Already scheme-qualified names pass through untouched.
        if name.contains(':') {
            return name;
        }

        // Absolute paths get a scheme from their extension and live under
        // the current app namespace.
        if name.starts_with('/') {
            let scheme = scheme_for_path(&name);
            return format!("{scheme}/{}{name}", self.app_name);
        }

        // Everything else is process-local shared state.
        format!("app:{name}")
    }
}

/// Infers a topic scheme from a path's file extension.
fn scheme_for_path(path: &str) -> &'static str {
    let extension = path
        .rsplit('/')
        .next()
        .and_then(|file| file.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "json" | "jsonc" => "json:",
        "js" => "javascript:",
        "sql" => "query:",
        ext if IMAGE_EXTENSIONS.contains(&ext) => "image:",
        _ => "file:",
    }
}
