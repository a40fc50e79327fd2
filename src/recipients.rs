use crate::message::Recipient;
use rhai::Dynamic;

/// What a reconciliation changed on the host side.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecipientChanges {
    pub removed: Vec<String>,
    pub added: Vec<String>,
    pub wiped: bool,
}

impl RecipientChanges {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty() && !self.wiped
    }
}

/// Pull the working list out of whatever the script left bound to
/// `recipients`. `None` means the binding is gone, is not an array, or is
/// an empty array.
pub fn working_list(binding: Option<Dynamic>) -> Option<Vec<String>> {
    let array = binding?.flatten().into_array().ok()?;
    if array.is_empty() {
        return None;
    }

    let addresses = array
        .into_iter()
        .filter_map(|item| match item.into_string() {
            Ok(address) => Some(address),
            Err(type_name) => {
                log::warn!("Ignoring recipient of type {type_name}, only strings are addresses");
                None
            }
        })
        .collect();
    Some(addresses)
}

/// Apply the script's working list to the host recipients.
///
/// `original` is the address list captured before the script ran and must
/// line up index for index with `host`.
pub fn reconcile(
    host: &mut Vec<Recipient>,
    original: &[String],
    working: Option<&[String]>,
) -> RecipientChanges {
    let mut changes = RecipientChanges::default();

    let working = match working {
        Some(working) => working,
        None => {
            changes.removed = host.drain(..).map(|r| r.address).collect();
            changes.wiped = true;
            return changes;
        }
    };

    debug_assert_eq!(host.len(), original.len());

    // Back to front: removing index i shifts everything after it.
    for (index, address) in original.iter().enumerate().rev() {
        if !working.contains(address) && index < host.len() {
            let removed = host.remove(index);
            changes.removed.push(removed.address);
        }
    }
    changes.removed.reverse();

    for address in working {
        if original.contains(address) || changes.added.contains(address) {
            continue;
        }
        host.push(Recipient::new(address.clone()));
        changes.added.push(address.clone());
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(addresses: &[&str]) -> Vec<Recipient> {
        addresses.iter().map(|a| Recipient::new(*a)).collect()
    }

    fn strings(addresses: &[&str]) -> Vec<String> {
        addresses.iter().map(|a| a.to_string()).collect()
    }

    fn addresses(host: &[Recipient]) -> Vec<&str> {
        host.iter().map(|r| r.address.as_str()).collect()
    }

    #[test]
    fn test_removal_preserves_order() {
        let original = strings(&["a", "b", "c"]);
        let mut recipients = host(&["a", "b", "c"]);

        let changes = reconcile(&mut recipients, &original, Some(strings(&["a", "c"]).as_slice()));
        assert_eq!(addresses(&recipients), vec!["a", "c"]);
        assert_eq!(changes.removed, vec!["b".to_string()]);
        assert!(changes.added.is_empty());
    }

    #[test]
    fn test_additions_append_in_working_order() {
        let original = strings(&["a"]);
        let mut recipients = host(&["a"]);

        let changes = reconcile(&mut recipients, &original, Some(strings(&["a", "b", "c"]).as_slice()));
        assert_eq!(addresses(&recipients), vec!["a", "b", "c"]);
        assert_eq!(changes.added, strings(&["b", "c"]));
    }

    #[test]
    fn test_wipe() {
        let original = strings(&["a", "b"]);
        let mut recipients = host(&["a", "b"]);

        let changes = reconcile(&mut recipients, &original, None);
        assert!(recipients.is_empty());
        assert!(changes.wiped);
        assert_eq!(changes.removed, original);
    }

    #[test]
    fn test_reordering_is_not_a_change() {
        let original = strings(&["a", "b", "c"]);
        let mut recipients = host(&["a", "b", "c"]);

        let changes = reconcile(&mut recipients, &original, Some(strings(&["c", "a", "b", "a"]).as_slice()));
        assert_eq!(addresses(&recipients), vec!["a", "b", "c"]);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_duplicate_new_address_added_once() {
        let original = strings(&["a"]);
        let mut recipients = host(&["a"]);

        reconcile(&mut recipients, &original, Some(strings(&["a", "new", "new"]).as_slice()));
        assert_eq!(addresses(&recipients), vec!["a", "new"]);
    }

    #[test]
    fn test_duplicates_in_original_removed_together() {
        let original = strings(&["a", "b", "a"]);
        let mut recipients = host(&["a", "b", "a"]);

        reconcile(&mut recipients, &original, Some(strings(&["b"]).as_slice()));
        assert_eq!(addresses(&recipients), vec!["b"]);
    }

    #[test]
    fn test_removal_keeps_recipient_details() {
        let original = strings(&["a", "b"]);
        let mut recipients = host(&["a", "b"]);
        recipients[1].errors_to = Some("bounces@example.com".to_string());

        reconcile(&mut recipients, &original, Some(strings(&["b"]).as_slice()));
        assert_eq!(recipients[0].errors_to.as_deref(), Some("bounces@example.com"));
    }

    #[test]
    fn test_working_list_extraction() {
        assert_eq!(working_list(None), None);
        assert_eq!(working_list(Some(Dynamic::UNIT)), None);
        assert_eq!(working_list(Some(Dynamic::from("a@example.com"))), None);
        assert_eq!(working_list(Some(Dynamic::from_array(Vec::new()))), None);

        let mixed = vec![Dynamic::from("a@example.com"), Dynamic::from(42_i64)];
        assert_eq!(
            working_list(Some(Dynamic::from_array(mixed))),
            Some(vec!["a@example.com".to_string()])
        );
    }
}
