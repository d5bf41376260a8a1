//! One-line, human-readable rendering of bus events.

use webradio_core::Event;

pub fn format_event(event: &Event) -> String {
    match event {
        Event::Version(version) => format!("webradio version {version}"),
        Event::IcyMeta(title) => title.clone(),
        Event::IcyName(name) => name.clone(),
        Event::VolSet(volume) => format!("setting current volume to {volume}"),
        Event::Play(url) => format!("playing {url}"),
        Event::Pause(url) => format!("pausing {url}"),
        Event::KeepAlive(time) => format!("current time: {time}"),
        Event::Eof { name, .. } => format!("{name} finished"),
        other => format!("{other:?}"),
    }
}
