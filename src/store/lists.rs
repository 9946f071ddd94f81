use super::{read, write, AggregationStore, StoreError};
use super::types::{FeedId, FeedList, ListId};
use crate::util::sanitize_name;

impl AggregationStore {
    /// Creates a list, or returns the id of an existing list with the same
    /// name (case-insensitive).
    pub fn create_list(&self, name: &str) -> Result<ListId, StoreError> {
        let name = sanitize_name(name).ok_or(StoreError::InvalidName)?;
        let folded = name.to_lowercase();
        let mut catalog = write(&self.catalog);
        if let Some(existing) = catalog
            .lists
            .values()
            .find(|l| l.name.to_lowercase() == folded)
        {
            return Ok(existing.id);
        }

        let id = ListId(catalog.next_list_id);
        catalog.next_list_id += 1;
        catalog.lists.insert(
            id,
            FeedList {
                id,
                name,
                feed_ids: Vec::new(),
            },
        );
        Ok(id)
    }

    pub fn rename_list(&self, list_id: ListId, name: &str) -> Result<(), StoreError> {
        if list_id.is_default() {
            return Err(StoreError::DefaultListImmutable);
        }
        let name = sanitize_name(name).ok_or(StoreError::InvalidName)?;
        write(&self.catalog).list_mut(list_id)?.name = name;
        Ok(())
    }

    /// Removes a list. Its feeds move to the end of the default list; no
    /// feed or article is deleted. Returns the moved feed ids.
    pub fn remove_list(&self, list_id: ListId) -> Result<Vec<FeedId>, StoreError> {
        if list_id.is_default() {
            return Err(StoreError::DefaultListImmutable);
        }
        let mut catalog = write(&self.catalog);
        let list = catalog
            .lists
            .remove(&list_id)
            .ok_or(StoreError::UnknownList(list_id))?;

        for feed_id in &list.feed_ids {
            if let Some(feed) = catalog.feeds.get_mut(feed_id) {
                feed.list_id = ListId::DEFAULT;
            }
        }
        catalog
            .list_mut(ListId::DEFAULT)?
            .feed_ids
            .extend(list.feed_ids.iter().copied());

        tracing::debug!(list_id = %list_id, moved = list.feed_ids.len(), "List removed");
        Ok(list.feed_ids)
    }

    /// Moves a feed to the end of another list. Moving to its current list
    /// is a no-op.
    pub fn move_feed(&self, feed_id: FeedId, list_id: ListId) -> Result<(), StoreError> {
        let mut catalog = write(&self.catalog);
        catalog.list(list_id)?;
        let from = catalog.feed(feed_id)?.list_id;
        if from == list_id {
            return Ok(());
        }

        if let Some(list) = catalog.lists.get_mut(&from) {
            list.feed_ids.retain(|id| *id != feed_id);
        }
        catalog.list_mut(list_id)?.feed_ids.push(feed_id);
        catalog.feed_mut(feed_id)?.list_id = list_id;
        Ok(())
    }

    /// All lists, default list first.
    pub fn lists(&self) -> Vec<FeedList> {
        read(&self.catalog).lists.values().cloned().collect()
    }

    pub fn list(&self, list_id: ListId) -> Option<FeedList> {
        read(&self.catalog).lists.get(&list_id).cloned()
    }

    /// Case-insensitive lookup by name.
    pub fn list_by_name(&self, name: &str) -> Option<ListId> {
        let name = name.trim().to_lowercase();
        read(&self.catalog)
            .lists
            .values()
            .find(|l| l.name.to_lowercase() == name)
            .map(|l| l.id)
    }
}
