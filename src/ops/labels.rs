use rusqlite::Connection;
use serde::Deserialize;

use super::{Actor, owned_tracker};
use crate::error::{Error, Result};
use crate::store::trackers as store;
use crate::types::{Label, Tracker};
use crate::validation::{validate_color, validate_label_name};
use crate::webhooks::{Subject, WebhookEvent};

#[derive(Debug, Clone, Deserialize)]
pub struct LabelInput {
    pub name: String,
    pub background_color: String,
    pub foreground_color: String,
}

impl LabelInput {
    fn validate(&self) -> Result<()> {
        validate_label_name(&self.name)?;
        validate_color(&self.background_color)?;
        validate_color(&self.foreground_color)
    }
}

fn owned_label(
    conn: &Connection,
    actor: &Actor<'_>,
    tracker_id: i64,
    label_id: i64,
) -> Result<(Tracker, Label)> {
    let tracker = owned_tracker(conn, actor, tracker_id)?;
    let label = store::labels_by_ids(conn, Some(actor.user.id), &[label_id])?
        .pop()
        .flatten()
        .filter(|label| label.tracker_id == tracker.id)
        .ok_or(Error::NotFound)?;
    Ok((tracker, label))
}

pub fn create_label(
    conn: &Connection,
    actor: &Actor<'_>,
    tracker_id: i64,
    input: &LabelInput,
) -> Result<Label> {
    input.validate()?;
    let tracker = owned_tracker(conn, actor, tracker_id)?;
    let label = store::create_label(
        conn,
        tracker.id,
        input.name.trim(),
        &input.background_color,
        &input.foreground_color,
    )?;
    actor
        .dispatcher(conn)?
        .schedule(WebhookEvent::LabelCreated, &Subject::Label(&label, &tracker))?;
    Ok(label)
}

pub fn update_label(
    conn: &Connection,
    actor: &Actor<'_>,
    tracker_id: i64,
    label_id: i64,
    input: &LabelInput,
) -> Result<Label> {
    input.validate()?;
    let (tracker, _) = owned_label(conn, actor, tracker_id, label_id)?;
    if let Some(existing) = store::label_by_name(conn, tracker.id, input.name.trim())?
        && existing.id != label_id
    {
        return Err(Error::Conflict(format!(
            "a label named {} already exists",
            existing.name
        )));
    }
    let label = store::update_label(
        conn,
        label_id,
        input.name.trim(),
        &input.background_color,
        &input.foreground_color,
    )?;
    actor
        .dispatcher(conn)?
        .schedule(WebhookEvent::LabelUpdate, &Subject::Label(&label, &tracker))?;
    Ok(label)
}

/// Deletes a label and removes it from every ticket.
pub fn delete_label(
    conn: &Connection,
    actor: &Actor<'_>,
    tracker_id: i64,
    label_id: i64,
) -> Result<Label> {
    let (tracker, label) = owned_label(conn, actor, tracker_id, label_id)?;
    actor
        .dispatcher(conn)?
        .schedule(WebhookEvent::LabelDeleted, &Subject::Label(&label, &tracker))?;
    store::delete_label(conn, label.id)?;
    Ok(label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::testing::{ORIGIN, resolver, store, user};
    use crate::ops::trackers::{TrackerInput, create_tracker};
    use crate::types::Visibility;

    fn input(name: &str) -> LabelInput {
        LabelInput {
            name: name.into(),
            background_color: "#ff0000".into(),
            foreground_color: "#fff".into(),
        }
    }

    #[test]
    fn test_label_lifecycle() {
        let store = store();
        let owner = user(&store, "u1");
        let resolver = resolver();
        let actor = Actor::new(&owner, ORIGIN, &resolver);

        let tracker = store
            .transaction(|tx| {
                create_tracker(
                    tx,
                    &actor,
                    &TrackerInput {
                        name: "projA".into(),
                        description: None,
                        visibility: Visibility::Public,
                    },
                )
            })
            .unwrap();
        let bug = store
            .transaction(|tx| create_label(tx, &actor, tracker.id, &input("bug")))
            .unwrap();
        let feature = store
            .transaction(|tx| create_label(tx, &actor, tracker.id, &input("feature")))
            .unwrap();

        let clash = store.transaction(|tx| update_label(tx, &actor, tracker.id, feature.id, &input("bug")));
        assert!(matches!(clash, Err(Error::Conflict(_))));

        let renamed = store
            .transaction(|tx| update_label(tx, &actor, tracker.id, bug.id, &input("defect")))
            .unwrap();
        assert_eq!(renamed.name, "defect");

        let bad_color = LabelInput {
            background_color: "red".into(),
            ..input("x")
        };
        assert!(matches!(
            store.transaction(|tx| create_label(tx, &actor, tracker.id, &bad_color)),
            Err(Error::Invalid(_))
        ));

        store
            .transaction(|tx| delete_label(tx, &actor, tracker.id, bug.id))
            .unwrap();
        assert!(matches!(
            store.transaction(|tx| delete_label(tx, &actor, tracker.id, bug.id)),
            Err(Error::NotFound)
        ));
    }
}
