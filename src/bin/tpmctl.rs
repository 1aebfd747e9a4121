// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! CLI client for the companion TPM control protocol (spec.md 4.10, 6).

use cryptvol::tpmctl::{exit_code, Client, Command, FdeKeyType};

fn usage() -> ! {
    eprintln!(
        "usage: tpmctl [--socket PATH] <dmcrypt-setup KEY_HEX | dmcrypt-lock | dmcrypt-reset | \
         exit | random-req LEN | clear | change-owner-pwd OLD NEW>"
    );
    std::process::exit(exit_code::USAGE);
}

fn socket_path_from_env_or_default(flag: Option<&str>) -> String {
    flag.map(str::to_string)
        .or_else(|| std::env::var("TPM2D_CONTROL_SOCK").ok())
        .unwrap_or_else(|| cryptvol::tpmctl::DEFAULT_SOCKET_PATH.to_string())
}

fn main() {
    env_logger::init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let mut socket: Option<String> = None;
    if args.first().map(String::as_str) == Some("--socket") {
        if args.len() < 2 {
            usage();
        }
        socket = Some(args.remove(1));
        args.remove(0);
    }
    let socket = socket_path_from_env_or_default(socket.as_deref());

    if args.is_empty() {
        usage();
    }

    let cmd = match args[0].as_str() {
        "dmcrypt-setup" => {
            if args.len() != 2 {
                usage();
            }
            let key_hex = args[1].clone();
            let key_type = match FdeKeyType::from_key_len(key_hex.len() / 2) {
                Some(t) => t,
                None => {
                    eprintln!("key length does not map to a supported FDE key type");
                    std::process::exit(exit_code::USAGE);
                }
            };
            Command::DmcryptSetup { key_hex, key_type }
        }
        "dmcrypt-lock" => Command::DmcryptLock,
        "dmcrypt-reset" => Command::DmcryptReset,
        "exit" => Command::Exit,
        "random-req" => {
            if args.len() != 2 {
                usage();
            }
            let len: u32 = args[1].parse().unwrap_or_else(|_| usage());
            Command::RandomRequest { len }
        }
        "clear" => Command::Clear,
        "change-owner-pwd" => {
            if args.len() != 3 {
                usage();
            }
            Command::ChangeOwnerPwd { old: args[1].clone(), new: args[2].clone() }
        }
        _ => usage(),
    };

    let mut client = match Client::connect(&socket) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("tpmctl: {e:?}");
            std::process::exit(e.exit_code());
        }
    };

    match client.send(&cmd) {
        Ok(resp) => {
            println!("{}", resp.message);
            std::process::exit(if resp.ok { exit_code::SUCCESS } else { exit_code::USAGE });
        }
        Err(e) => {
            eprintln!("tpmctl: {e:?}");
            std::process::exit(e.exit_code());
        }
    }
}
