//! Real ed25519 public keys for fixtures, private halves were discarded.

pub const ALICE: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIP+rLVdhR45rKrxVpsFkn2RmQs9bEouHVgsNvQql7KwB user1@host";
pub const BOB: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAINnlkjhmW2482MS5BO1zGB+/8tHjBBOo9OOpuvjMBWPR user2@host";
pub const CAROL: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAICpC2J+e1IomdoMLL+I50LXyrSRdpmWc8694wANoaXNY user3@host";
pub const DAVE: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIDyXeKKUEuIK1/VtUbk0UNnYCSAJ5RKmchc/HhWlHSXv user4@host";

/// An authorized keys file with three entries
pub fn three_entry_file() -> String {
    format!("{ALICE}\n{BOB}\n{CAROL}\n")
}
