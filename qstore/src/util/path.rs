//! Slash separated device paths. Device paths never start or end with `/`,
//! the empty path names the container root.

pub fn clean(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

pub fn join<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined: Vec<String> = parts
        .into_iter()
        .map(|p| clean(p.as_ref()))
        .filter(|p| !p.is_empty())
        .collect();
    joined.join("/")
}

/// Parent of a cleaned path, `""` for top level entries.
pub fn parent(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => "",
    }
}

pub fn base(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((_, name)) => name,
        None => path,
    }
}
