use super::{lock, read, write, AggregationStore, StoreError};
use super::types::{Tag, TagId};
use crate::feed::ArticleIdentity;
use crate::util::sanitize_name;

impl AggregationStore {
    pub fn create_tag(&self, name: &str, color: Option<&str>) -> Result<TagId, StoreError> {
        let name = sanitize_name(name).ok_or(StoreError::InvalidName)?;
        let mut catalog = write(&self.catalog);
        let id = TagId(catalog.next_tag_id);
        catalog.next_tag_id += 1;
        catalog.tags.insert(
            id,
            Tag {
                id,
                name,
                color: color.and_then(sanitize_name),
            },
        );
        Ok(id)
    }

    pub fn rename_tag(&self, tag_id: TagId, name: &str) -> Result<(), StoreError> {
        let name = sanitize_name(name).ok_or(StoreError::InvalidName)?;
        write(&self.catalog)
            .tags
            .get_mut(&tag_id)
            .ok_or(StoreError::UnknownTag(tag_id))?
            .name = name;
        Ok(())
    }

    /// Deletes a tag and detaches it from every article. Returns how many
    /// articles carried it.
    pub fn delete_tag(&self, tag_id: TagId) -> Result<usize, StoreError> {
        let mut catalog = write(&self.catalog);
        catalog
            .tags
            .remove(&tag_id)
            .ok_or(StoreError::UnknownTag(tag_id))?;

        let mut detached = 0;
        for shard in read(&self.shards).values() {
            for article in lock(shard).articles.values_mut() {
                if article.tags.remove(&tag_id) {
                    detached += 1;
                }
            }
        }
        Ok(detached)
    }

    pub fn tags(&self) -> Vec<Tag> {
        read(&self.catalog).tags.values().cloned().collect()
    }

    pub fn tag(&self, tag_id: TagId) -> Option<Tag> {
        read(&self.catalog).tags.get(&tag_id).cloned()
    }

    /// Returns `false` if the article already carried the tag.
    pub fn attach_tag(&self, identity: &ArticleIdentity, tag_id: TagId) -> Result<bool, StoreError> {
        // Held so the tag cannot be deleted underneath us
        let catalog = read(&self.catalog);
        if !catalog.tags.contains_key(&tag_id) {
            return Err(StoreError::UnknownTag(tag_id));
        }
        self.update_article(identity, |article| article.tags.insert(tag_id))
    }

    /// Returns `false` if the article did not carry the tag.
    pub fn detach_tag(&self, identity: &ArticleIdentity, tag_id: TagId) -> Result<bool, StoreError> {
        self.update_article(identity, |article| article.tags.remove(&tag_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::RawItem;

    fn store_with_articles() -> (AggregationStore, Vec<ArticleIdentity>) {
        let store = AggregationStore::new();
        let feed = store.add_feed("https://a.com/rss", None, None).unwrap();
        let items: Vec<RawItem> = ["1", "2", "3"]
            .iter()
            .map(|g| RawItem {
                guid: Some(g.to_string()),
                ..RawItem::default()
            })
            .collect();
        let ids = store
            .merge(feed, &items)
            .unwrap()
            .into_iter()
            .map(|a| a.identity)
            .collect();
        (store, ids)
    }

    #[test]
    fn test_attach_and_detach() {
        let (store, ids) = store_with_articles();
        let tag = store.create_tag("Read later", Some("#00ff00")).unwrap();

        assert!(store.attach_tag(&ids[0], tag).unwrap());
        assert!(!store.attach_tag(&ids[0], tag).unwrap());
        assert!(store.article(&ids[0]).unwrap().tags.contains(&tag));

        assert!(store.detach_tag(&ids[0], tag).unwrap());
        assert!(!store.detach_tag(&ids[0], tag).unwrap());
        assert!(store.article(&ids[0]).unwrap().tags.is_empty());
    }

    #[test]
    fn test_attach_unknown_tag_or_article() {
        let (store, ids) = store_with_articles();
        assert_eq!(
            store.attach_tag(&ids[0], TagId(5)),
            Err(StoreError::UnknownTag(TagId(5)))
        );
        let tag = store.create_tag("x", None).unwrap();
        let missing = ArticleIdentity::from_raw("missing");
        assert_eq!(
            store.attach_tag(&missing, tag),
            Err(StoreError::UnknownArticle(missing))
        );
    }

    #[test]
    fn test_delete_tag_detaches_everywhere() {
        let (store, ids) = store_with_articles();
        let tag = store.create_tag("Work", None).unwrap();
        let keep = store.create_tag("Home", None).unwrap();
        store.attach_tag(&ids[0], tag).unwrap();
        store.attach_tag(&ids[1], tag).unwrap();
        store.attach_tag(&ids[1], keep).unwrap();

        assert_eq!(store.delete_tag(tag).unwrap(), 2);
        assert!(store.tag(tag).is_none());
        assert!(store.article(&ids[0]).unwrap().tags.is_empty());
        assert_eq!(
            store.article(&ids[1]).unwrap().tags.into_iter().collect::<Vec<_>>(),
            vec![keep]
        );
        assert_eq!(store.delete_tag(tag), Err(StoreError::UnknownTag(tag)));
    }

    #[test]
    fn test_rename_tag() {
        let store = AggregationStore::new();
        let tag = store.create_tag("Wrok", Some("  ")).unwrap();
        store.rename_tag(tag, "Work").unwrap();
        let stored = store.tag(tag).unwrap();
        assert_eq!(stored.name, "Work");
        assert_eq!(stored.color, None);
        assert_eq!(store.rename_tag(TagId(42), "x"), Err(StoreError::UnknownTag(TagId(42))));
    }
}
