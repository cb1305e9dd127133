pub mod recipient_email;
pub mod recipient_name;
pub mod roster;

pub use recipient_email::RecipientEmail;
pub use recipient_name::RecipientName;
pub use roster::{
    parse_delimiter_hint, read_roster, sniff_delimiter, Delimiter, Roster, RosterError, Row,
};
