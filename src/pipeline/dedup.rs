use std::collections::HashSet;

use crate::storage::{Database, NewArticle, PersistenceError};

/// Drops candidates whose link is already stored or repeated earlier in `candidates`.
///
/// Order is preserved and the first occurrence of a link wins. The store is
/// queried once for the whole batch.
pub async fn dedupe(
    db: &Database,
    candidates: Vec<NewArticle>,
) -> Result<Vec<NewArticle>, PersistenceError> {
    let mut seen = HashSet::with_capacity(candidates.len());
    let unique: Vec<NewArticle> = candidates
        .into_iter()
        .filter(|c| seen.insert(c.link.clone()))
        .collect();

    if unique.is_empty() {
        return Ok(unique);
    }

    let links: Vec<&str> = unique.iter().map(|c| c.link.as_str()).collect();
    let known = db.existing_links(&links).await?;

    Ok(unique
        .into_iter()
        .filter(|c| !known.contains(&c.link))
        .collect())
}
