//! Terminal stand-ins for the notification surface and permission screens.

use tracing::info;

use reveille_engine::{NotificationSurface, PermissionPrompter, RenderedNotification};

/// Prints notifications to stdout.
#[derive(Debug, Default)]
pub struct TerminalSurface;

impl NotificationSurface for TerminalSurface {
    fn render(&self, notification: &RenderedNotification) {
        println!("{}", format_notification(notification));
        info!(id = %notification.id, title = %notification.title, "notification shown");
    }
}

fn format_notification(notification: &RenderedNotification) -> String {
    format!(
        "[reminder {}] {}\n    {}",
        notification.id, notification.title, notification.body
    )
}

/// Points the user at the commands that change permissions.
#[derive(Debug, Default)]
pub struct TerminalPrompter;

impl PermissionPrompter for TerminalPrompter {
    fn request_exact_alarm_permission(&self) {
        println!("Exact alarms let reminders fire on time.");
        println!("Grant them with: reveille permission exact --grant");
    }

    fn request_battery_optimization_exemption(&self) {
        println!("Without the battery exemption, inexact reminders are batched to the next minute.");
        println!("Grant it with: reveille permission battery --grant");
    }
}
