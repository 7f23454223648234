mod dump;
mod subscriptions;
mod tickets;
mod trackers;
mod webhooks;

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, patch, post, put},
};

use crate::server::AppState;

pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/me", get(trackers::me))
        // Trackers
        .route("/trackers", get(trackers::list_trackers))
        .route("/trackers", post(trackers::create_tracker))
        .route("/trackers/{id}", get(trackers::get_tracker))
        .route("/trackers/{id}", patch(trackers::update_tracker))
        .route("/trackers/{id}", delete(trackers::delete_tracker))
        .route(
            "/users/{username}/trackers/{name}",
            get(trackers::get_tracker_by_name),
        )
        .route("/trackers/{id}/acls", get(trackers::list_acls))
        .route("/trackers/{id}/acls", put(trackers::set_acl))
        .route("/trackers/{id}/acls/{user_id}", delete(trackers::delete_acl))
        // Labels
        .route("/trackers/{id}/labels", get(trackers::list_labels))
        .route("/trackers/{id}/labels", post(trackers::create_label))
        .route("/trackers/{id}/labels/{label_id}", patch(trackers::update_label))
        .route("/trackers/{id}/labels/{label_id}", delete(trackers::delete_label))
        // Tickets
        .route("/trackers/{id}/tickets", get(tickets::list_tickets))
        .route("/trackers/{id}/tickets", post(tickets::submit_ticket))
        .route("/trackers/{id}/tickets/{ticket_id}", get(tickets::get_ticket))
        .route("/trackers/{id}/tickets/{ticket_id}", patch(tickets::update_ticket))
        .route("/trackers/{id}/tickets/{ticket_id}", delete(tickets::delete_ticket))
        .route(
            "/trackers/{id}/tickets/{ticket_id}/events",
            get(tickets::list_events),
        )
        .route(
            "/trackers/{id}/tickets/{ticket_id}/comments",
            post(tickets::comment),
        )
        .route(
            "/trackers/{id}/tickets/{ticket_id}/comments/{comment_id}",
            patch(tickets::edit_comment),
        )
        .route(
            "/trackers/{id}/tickets/{ticket_id}/status",
            put(tickets::update_status),
        )
        .route(
            "/trackers/{id}/tickets/{ticket_id}/labels",
            post(tickets::add_label),
        )
        .route(
            "/trackers/{id}/tickets/{ticket_id}/labels/{label_id}",
            delete(tickets::remove_label),
        )
        .route(
            "/trackers/{id}/tickets/{ticket_id}/assignees",
            post(tickets::assign),
        )
        .route(
            "/trackers/{id}/tickets/{ticket_id}/assignees/{username}",
            delete(tickets::unassign),
        )
        // Subscriptions and notifications
        .route(
            "/trackers/{id}/subscription",
            post(subscriptions::subscribe_tracker),
        )
        .route(
            "/trackers/{id}/subscription",
            delete(subscriptions::unsubscribe_tracker),
        )
        .route(
            "/trackers/{id}/tickets/{ticket_id}/subscription",
            post(subscriptions::subscribe_ticket),
        )
        .route(
            "/trackers/{id}/tickets/{ticket_id}/subscription",
            delete(subscriptions::unsubscribe_ticket),
        )
        .route("/subscriptions", get(subscriptions::list_subscriptions))
        .route("/inbox", get(subscriptions::inbox))
        // Webhooks
        .route("/webhooks/{kind}", get(webhooks::list_webhooks))
        .route("/webhooks/{kind}", post(webhooks::create_webhook))
        .route("/webhooks/{kind}/{id}", get(webhooks::get_webhook))
        .route("/webhooks/{kind}/{id}", delete(webhooks::delete_webhook))
        .route(
            "/webhooks/{kind}/{id}/deliveries",
            get(webhooks::list_deliveries),
        )
        // Export and import
        .route("/trackers/{id}/export", get(dump::export_tracker))
        .route("/trackers/{id}/import", post(dump::import_tracker))
}
