use serde::Serialize;

/// A banknote face value in rupiah and the label the model's class is reported as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Denomination {
    pub label: &'static str,
    pub value: u64,
}

/// Class index to denomination, in the order the model was trained with.
pub static DENOMINATIONS: [(i32, Denomination); 8] = [
    (0, Denomination { label: "100ribu", value: 100_000 }),
    (1, Denomination { label: "10ribu", value: 10_000 }),
    (2, Denomination { label: "1ribu", value: 1_000 }),
    (3, Denomination { label: "2ribu", value: 2_000 }),
    (4, Denomination { label: "50ribu", value: 50_000 }),
    (5, Denomination { label: "20ribu", value: 20_000 }),
    (6, Denomination { label: "5ribu", value: 5_000 }),
    (7, Denomination { label: "75ribu", value: 75_000 }),
];

impl Denomination {
    /// Looks up the denomination for a model class index
    pub fn for_class(class: i32) -> Option<Denomination> {
        DENOMINATIONS
            .iter()
            .find(|(index, _)| *index == class)
            .map(|(_, denomination)| *denomination)
    }
}
