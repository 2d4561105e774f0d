pub mod outbox_worker;
