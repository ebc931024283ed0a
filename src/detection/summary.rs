use crate::models::DetectionRecord;

/// Reply sent when the engine found nothing.
pub const NO_OBJECTS_MESSAGE: &str = "no objects detected";

/// Occurrences per class, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassCount {
    entries: Vec<(String, usize)>,
}

impl ClassCount {
    fn add(&mut self, class: &str) {
        match self.entries.iter_mut().find(|(name, _)| name == class) {
            Some((_, count)) => *count += 1,
            None => self.entries.push((class.to_string(), 1)),
        }
    }

    pub fn get(&self, class: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|(name, _)| name == class)
            .map(|(_, count)| *count)
    }

    pub fn total(&self) -> usize {
        self.entries.iter().map(|(_, count)| count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn render(&self) -> String {
        if self.entries.is_empty() {
            return NO_OBJECTS_MESSAGE.to_string();
        }
        self.entries
            .iter()
            .map(|(name, count)| format!("{name}: {count}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Count detections per class and render the reply text.
pub fn summarize(detections: &[DetectionRecord]) -> (ClassCount, String) {
    let mut counts = ClassCount::default();
    for detection in detections {
        counts.add(&detection.object_class);
    }
    let text = counts.render();
    (counts, text)
}
